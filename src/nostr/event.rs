//! Signed event model for the decentralized bus.
//!
//! Events are the only wire format the module speaks besides HTTP: JSON
//! objects `{id, pubkey, created_at, kind, tags, content, sig}` where `id`
//! is the SHA-256 of the canonical serialization and `sig` a BIP-340
//! Schnorr signature over it.

use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, SECP256K1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::timestamp::UnixTimestamp;
use crate::types::PublicKey;

/// Event kinds used by the card module.
pub mod kinds {
    /// Regular request/transaction events (config changes, transfers).
    pub const TRANSACTION: u32 = 1112;
    /// Ephemeral module responses (never stored by relays).
    pub const EPHEMERAL_RESPONSE: u32 = 21111;
    /// Parameterized-replaceable configuration documents.
    pub const REPLACEABLE_CONFIG: u32 = 31111;
}

/// `t`-tag topics the module publishes or consumes.
pub mod topics {
    pub const CARD_ACTIVATION_REQUEST: &str = "card-activation-request";
    pub const CARD_ACTIVATION_RESPONSE: &str = "card-activation-response";
    pub const CARD_TRANSFER_DONATION: &str = "card-transfer-donation";
    pub const CARD_TRANSFER_ACCEPTANCE: &str = "card-transfer-acceptance";
    pub const CARD_TRANSFER_RESPONSE: &str = "card-transfer-response";
    pub const CARD_DATA: &str = "card-data";
    pub const CARD_CONFIG: &str = "card-config";
    pub const CARD_CONFIG_CHANGE: &str = "card-config-change";
    pub const INTERNAL_TRANSACTION_START: &str = "internal-transaction-start";
    pub const IDENTITY_TRANSFER_OK: &str = "identity-transfer-ok";
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event id does not match its contents")]
    IdMismatch,
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed pubkey: {0}")]
    MalformedPubkey(String),
}

/// A signed event as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: UnixTimestamp,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// The unsigned half of an event, ready for [`Event::finalize`].
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub created_at: UnixTimestamp,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

fn canonical_id(
    pubkey: &PublicKey,
    created_at: UnixTimestamp,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    let serialized = serde_json::to_string(&canonical).expect("canonical form serializes");
    Sha256::digest(serialized.as_bytes()).into()
}

impl Event {
    /// Sign a template with the given secret key, producing a full event.
    pub fn finalize(template: EventTemplate, secret_key: &SecretKey) -> Event {
        let keypair = Keypair::from_secret_key(SECP256K1, secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey = PublicKey(xonly.serialize());
        let id = canonical_id(
            &pubkey,
            template.created_at,
            template.kind,
            &template.tags,
            &template.content,
        );
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(id), &keypair);
        Event {
            id: hex::encode(id),
            pubkey,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig: sig.to_string(),
        }
    }

    /// Recompute the canonical id and check the Schnorr signature.
    pub fn verify_signature(&self) -> Result<(), EventError> {
        let id = canonical_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(id) != self.id.to_lowercase() {
            return Err(EventError::IdMismatch);
        }
        let sig_bytes: [u8; 64] = hex::decode(&self.sig)
            .map_err(|e| EventError::MalformedSignature(e.to_string()))?
            .try_into()
            .map_err(|_| EventError::MalformedSignature("expected 64 bytes".to_string()))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| EventError::MalformedSignature(e.to_string()))?;
        let xonly = XOnlyPublicKey::from_slice(self.pubkey.as_bytes())
            .map_err(|e| EventError::MalformedPubkey(e.to_string()))?;
        SECP256K1
            .verify_schnorr(&sig, &Message::from_digest(id), &xonly)
            .map_err(|_| EventError::InvalidSignature)
    }

    /// First tag whose name (element 0) matches.
    pub fn first_tag(&self, name: &str) -> Option<&Vec<String>> {
        self.tags.iter().find(|t| t.first().map(String::as_str) == Some(name))
    }

    /// Value (element 1) of the first matching tag.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.first_tag(name)?.get(1).map(String::as_str)
    }

    /// The event's topic: the value of its first `t` tag.
    pub fn topic(&self) -> Option<&str> {
        self.tag_value("t")
    }

    /// All `p`-tagged public keys, in tag order. Unparseable keys are skipped.
    pub fn p_tags(&self) -> Vec<PublicKey> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("p"))
            .filter_map(|t| t.get(1)?.parse().ok())
            .collect()
    }

    /// The NIP-26 delegation tag, if present:
    /// `(delegator, conditions, token)`.
    pub fn delegation_tag(&self) -> Option<(PublicKey, String, String)> {
        let tag = self.first_tag("delegation")?;
        let delegator: PublicKey = tag.get(1)?.parse().ok()?;
        let conditions = tag.get(2)?.clone();
        let token = tag.get(3)?.clone();
        Some((delegator, conditions, token))
    }
}

/// Derive the x-only public key for a secret key.
pub fn public_key_for(secret_key: &SecretKey) -> PublicKey {
    let keypair = Keypair::from_secret_key(SECP256K1, secret_key);
    PublicKey(keypair.x_only_public_key().0.serialize())
}
