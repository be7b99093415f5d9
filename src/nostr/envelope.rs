//! Multi-recipient NIP-04 envelope.
//!
//! Card configuration documents must be readable by both the module and the
//! holder, so the plaintext is encrypted once per recipient and the event
//! content carries the list of ciphertexts alongside the recipient keys:
//!
//! ```json
//! {"enc-algo":"nip-04","ciphertext":["…?iv=…","…?iv=…"],"recipients":["…","…"]}
//! ```

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::nostr::nip04;
use crate::types::PublicKey;

const ENC_ALGO: &str = "nip-04";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported enc-algo {0:?}")]
    UnsupportedAlgo(String),
    #[error("ciphertext and recipient counts differ")]
    CountMismatch,
    #[error("none of the envelope recipients matches this key")]
    NotARecipient,
    #[error(transparent)]
    Nip04(#[from] nip04::Nip04Error),
}

/// Wire form of the multi-recipient envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "enc-algo")]
    pub enc_algo: String,
    pub ciphertext: Vec<String>,
    pub recipients: Vec<PublicKey>,
}

/// Encrypt `plaintext` once per recipient, producing the canonical envelope
/// JSON used as event content.
pub fn seal(
    sender_secret: &SecretKey,
    plaintext: &str,
    recipients: &[PublicKey],
) -> Result<String, EnvelopeError> {
    let mut ciphertext = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        ciphertext.push(nip04::encrypt(sender_secret, recipient, plaintext)?);
    }
    let envelope = Envelope {
        enc_algo: ENC_ALGO.to_string(),
        ciphertext,
        recipients: recipients.to_vec(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Open an envelope as recipient `me`, using the sender's public key for
/// the ECDH half.
pub fn open(
    my_secret: &SecretKey,
    me: &PublicKey,
    sender: &PublicKey,
    content: &str,
) -> Result<String, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(content)?;
    if envelope.enc_algo != ENC_ALGO {
        return Err(EnvelopeError::UnsupportedAlgo(envelope.enc_algo));
    }
    if envelope.ciphertext.len() != envelope.recipients.len() {
        return Err(EnvelopeError::CountMismatch);
    }
    let index = envelope
        .recipients
        .iter()
        .position(|r| r == me)
        .ok_or(EnvelopeError::NotARecipient)?;
    Ok(nip04::decrypt(
        my_secret,
        sender,
        &envelope.ciphertext[index],
    )?)
}
