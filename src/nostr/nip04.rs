//! NIP-04 public-key-authenticated encryption.
//!
//! The shared key is the x coordinate of the ECDH point between the
//! sender's secret key and the recipient's public key (unhashed, per
//! NIP-04), used as an AES-256-CBC key with a random IV. The wire form is
//! `base64(ciphertext) + "?iv=" + base64(iv)`.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use rand::RngCore;
use secp256k1::{Parity, SecretKey, XOnlyPublicKey};

use crate::types::PublicKey;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum Nip04Error {
    #[error("malformed counterparty key: {0}")]
    MalformedKey(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("decryption failed")]
    Decryption,
    #[error("decrypted payload is not UTF-8")]
    NotUtf8,
}

/// ECDH shared key: x coordinate of `sk * pk`, with the x-only
/// counterparty key lifted to even parity.
fn shared_key(secret_key: &SecretKey, counterparty: &PublicKey) -> Result<[u8; 32], Nip04Error> {
    let xonly = XOnlyPublicKey::from_slice(counterparty.as_bytes())
        .map_err(|e| Nip04Error::MalformedKey(e.to_string()))?;
    let full = secp256k1::PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let point = secp256k1::ecdh::shared_secret_point(&full, secret_key);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt `plaintext` from `secret_key` to `recipient`.
pub fn encrypt(
    secret_key: &SecretKey,
    recipient: &PublicKey,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let key = shared_key(secret_key, recipient)?;
    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}?iv={}", b64.encode(ciphertext), b64.encode(iv)))
}

/// Decrypt a `ciphertext?iv=…` payload sent between `secret_key` and
/// `counterparty` (either direction; ECDH is symmetric).
pub fn decrypt(
    secret_key: &SecretKey,
    counterparty: &PublicKey,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::MalformedPayload("missing ?iv= separator".to_string()))?;
    let ciphertext = b64
        .decode(ct_b64)
        .map_err(|e| Nip04Error::MalformedPayload(e.to_string()))?;
    let iv: [u8; 16] = b64
        .decode(iv_b64)
        .map_err(|e| Nip04Error::MalformedPayload(e.to_string()))?
        .try_into()
        .map_err(|_| Nip04Error::MalformedPayload("iv must be 16 bytes".to_string()))?;
    let key = shared_key(secret_key, counterparty)?;
    let plain = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::Decryption)?;
    String::from_utf8(plain).map_err(|_| Nip04Error::NotUtf8)
}
