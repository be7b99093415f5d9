//! NTAG 424 DNA SUN (Secure Unique NFC) message verification.
//!
//! Every tap of a provisioned card produces a URL carrying `p` (the
//! AES-128-CBC encrypted PICC datagram: tag byte, 7-byte UID, 3-byte tap
//! counter) and `c` (the SDMMAC authentication tag). This module decrypts
//! `p` with the module-wide `k1` key, recomputes the SDMMAC with the card's
//! `k2` key, enforces strict counter monotonicity, and atomically persists
//! the accepted counter.
//!
//! The SDMMAC is the double-layer form the chip computes on silicon: a
//! session key is derived as `CMAC(k2, SV2)` where
//! `SV2 = 3C C3 00 01 00 80 || uid || ctr`, the final MAC is
//! `CMAC(session, "")`, and the wire tag keeps only the odd-indexed bytes.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use tracing::instrument;

use crate::store::model::Ntag;
use crate::store::{Store, StoreError};
use crate::types::{AesKey, CardId};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// SV2 prefix for SDM MAC session-key diversification (AN12196).
const SV2_PREFIX: [u8; 6] = [0x3c, 0xc3, 0x00, 0x01, 0x00, 0x80];

/// PICC data tag byte for a UID+counter mirror.
const PICC_TAG: u8 = 0xc7;

/// Highest counter value the 3-byte mirror can carry.
pub const MAX_COUNTER: u32 = 0x00ff_ffff;

#[derive(Debug, thiserror::Error)]
pub enum SunError {
    #[error("p must be 32 uppercase hex characters")]
    PiccShape,
    #[error("unexpected PICC data tag")]
    PiccTag,
    #[error("tap counter {received} is not greater than stored {stored}")]
    CounterNotAdvanced { received: u32, stored: u32 },
    #[error("c must be 16 uppercase hex characters")]
    CmacShape,
    #[error("SDMMAC mismatch")]
    CmacMismatch,
    #[error("card not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decrypted contents of the `p` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiccData {
    pub cid: CardId,
    pub counter: u32,
}

/// A verified tap: the card's NTAG record with its counter already advanced.
#[derive(Debug, Clone)]
pub struct TapAuth {
    pub ntag: Ntag,
    pub counter: u32,
}

fn is_upper_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
}

/// Decrypt and parse the `p` parameter with the module-wide `k1` key.
pub fn decrypt_picc(p: &str, k1: &AesKey) -> Result<PiccData, SunError> {
    if !is_upper_hex(p, 32) {
        return Err(SunError::PiccShape);
    }
    let mut buf = hex::decode(p).expect("shape checked");
    let iv = [0u8; 16];
    let plain = Aes128CbcDec::new(k1.as_bytes().into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| SunError::PiccShape)?;
    if plain[0] != PICC_TAG {
        return Err(SunError::PiccTag);
    }
    let cid = CardId(plain[1..8].try_into().expect("fixed length"));
    let counter = u32::from_le_bytes([plain[8], plain[9], plain[10], 0]);
    Ok(PiccData { cid, counter })
}

/// Compute the 8-byte SDMMAC for a UID and counter under the card's `k2`.
pub fn sdmmac(k2: &AesKey, cid: &CardId, counter: u32) -> [u8; 8] {
    let ctr = counter.to_le_bytes();
    let mut sv2 = [0u8; 16];
    sv2[..6].copy_from_slice(&SV2_PREFIX);
    sv2[6..13].copy_from_slice(cid.as_bytes());
    sv2[13..16].copy_from_slice(&ctr[..3]);

    let mut mac = <Cmac<aes::Aes128> as Mac>::new_from_slice(k2.as_bytes())
        .expect("AES-128 CMAC accepts 16-byte keys");
    mac.update(&sv2);
    let session_key: [u8; 16] = mac.finalize().into_bytes().into();

    let mut mac = <Cmac<aes::Aes128> as Mac>::new_from_slice(&session_key)
        .expect("AES-128 CMAC accepts 16-byte keys");
    mac.update(b"");
    let full: [u8; 16] = mac.finalize().into_bytes().into();

    // The chip transmits only the odd-indexed bytes of the final CMAC.
    [
        full[1], full[3], full[5], full[7], full[9], full[11], full[13], full[15],
    ]
}

/// Check the `c` parameter against the recomputed SDMMAC.
pub fn verify_tag(k2: &AesKey, cid: &CardId, counter: u32, c: &str) -> Result<(), SunError> {
    if !is_upper_hex(c, 16) {
        return Err(SunError::CmacShape);
    }
    let expected = sdmmac(k2, cid, counter);
    if hex::encode(expected) != c.to_lowercase() {
        return Err(SunError::CmacMismatch);
    }
    Ok(())
}

/// Produce the `(p, c)` pair a card with these keys would emit for `counter`.
///
/// Exact inverse of [`decrypt_picc`] + [`verify_tag`]; used by diagnostics
/// and tests. `pad` fills the five plaintext bytes after the counter.
pub fn generate_pc(
    k1: &AesKey,
    k2: &AesKey,
    cid: &CardId,
    counter: u32,
    pad: &[u8; 5],
) -> (String, String) {
    let ctr = counter.to_le_bytes();
    let mut plain = [0u8; 16];
    plain[0] = PICC_TAG;
    plain[1..8].copy_from_slice(cid.as_bytes());
    plain[8..11].copy_from_slice(&ctr[..3]);
    plain[11..16].copy_from_slice(pad);

    let iv = [0u8; 16];
    let encrypted = Aes128CbcEnc::new(k1.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<NoPadding>(&plain);
    let p = hex::encode_upper(encrypted);
    let c = hex::encode_upper(sdmmac(k2, cid, counter));
    (p, c)
}

/// Verify a tap end to end and persist the accepted counter.
///
/// The counter write is a conditional update (`stored < received`); losing a
/// race against a concurrent tap of the same card surfaces as
/// [`SunError::CounterNotAdvanced`], never as a double accept.
#[instrument(skip_all, err)]
pub async fn verify(
    store: &dyn Store,
    module_k1: &AesKey,
    p: &str,
    c: &str,
) -> Result<TapAuth, SunError> {
    if !is_upper_hex(c, 16) {
        return Err(SunError::CmacShape);
    }
    let picc = decrypt_picc(p, module_k1)?;
    let ntag = store
        .ntag_by_cid(&picc.cid)
        .await?
        .ok_or(SunError::NotFound)?;
    if ntag.k1 != *module_k1 {
        return Err(SunError::NotFound);
    }
    if picc.counter <= ntag.ctr {
        return Err(SunError::CounterNotAdvanced {
            received: picc.counter,
            stored: ntag.ctr,
        });
    }
    verify_tag(&ntag.k2, &picc.cid, picc.counter, c)?;
    let advanced = store.advance_ntag_counter(&picc.cid, picc.counter).await?;
    if !advanced {
        // A concurrent tap with a higher counter committed first.
        return Err(SunError::CounterNotAdvanced {
            received: picc.counter,
            stored: picc.counter,
        });
    }
    let mut ntag = ntag;
    ntag.ctr = picc.counter;
    Ok(TapAuth {
        ntag,
        counter: picc.counter,
    })
}
