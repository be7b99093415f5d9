//! Short-UUID serialization for single-use payment-request tokens.
//!
//! A 128-bit UUID is rendered as 22 base-64-alphabet digits
//! (`A–Z a–z 0–9 - _`), most significant first, zero-padded with leading
//! `A`s. The leading digit therefore only ever encodes the top two bits of
//! the value.

use uuid::Uuid;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Serialized length of every short UUID.
pub const SUUID_LEN: usize = 22;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SuuidError {
    #[error("expected {SUUID_LEN} characters, got {0}")]
    Length(usize),
    #[error("character {0:?} is outside the suuid alphabet")]
    Alphabet(char),
    #[error("value does not fit in 128 bits")]
    Overflow,
}

/// Encode a UUID as its 22-character short form.
pub fn uuid_to_suuid(uuid: &Uuid) -> String {
    let mut n = uuid.as_u128();
    let mut out = [b'A'; SUUID_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(n & 0x3f) as usize];
        n >>= 6;
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ASCII")
}

/// Decode a 22-character short form back into the UUID it encodes.
pub fn suuid_to_uuid(s: &str) -> Result<Uuid, SuuidError> {
    if s.len() != SUUID_LEN {
        return Err(SuuidError::Length(s.len()));
    }
    let mut n: u128 = 0;
    for c in s.chars() {
        let digit = ALPHABET
            .iter()
            .position(|&a| a as char == c)
            .ok_or(SuuidError::Alphabet(c))? as u128;
        n = n
            .checked_mul(64)
            .and_then(|n| n.checked_add(digit))
            .ok_or(SuuidError::Overflow)?;
    }
    Ok(Uuid::from_u128(n))
}
