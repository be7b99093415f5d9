//! NIP-26 delegation: one key authorizes another to sign events on its
//! behalf under a conditions query-string.
//!
//! Conditions here are always of the exact form
//! `kind=N&created_at>S&created_at<U` with one of each clause. The token is
//! a Schnorr signature by the delegator over
//! `sha256("nostr:delegation:<delegatee>:<conditions>")`.

use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, SECP256K1, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::timestamp::UnixTimestamp;
use crate::types::PublicKey;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Nip26Error {
    #[error("conditions clause {0:?} is not recognized")]
    UnknownClause(String),
    #[error("conditions must contain exactly one {0} clause")]
    ClauseCount(&'static str),
    #[error("conditions value {0:?} is not a positive integer")]
    BadValue(String),
    #[error("delegation window is empty (since >= until)")]
    EmptyWindow,
    #[error("malformed delegation token: {0}")]
    MalformedToken(String),
    #[error("delegation token signature is invalid")]
    InvalidToken,
    #[error("event kind {0} is outside the delegated kind")]
    KindOutsideConditions(u32),
    #[error("event timestamp {0} is outside the delegated window")]
    TimeOutsideConditions(UnixTimestamp),
}

/// Parsed `kind=N&created_at>S&created_at<U` conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditions {
    pub kind: u32,
    pub since: UnixTimestamp,
    pub until: UnixTimestamp,
    raw: String,
}

impl Conditions {
    /// Parse and validate a conditions string. Exactly one clause of each
    /// form must be present and the window must be non-empty.
    pub fn parse(raw: &str) -> Result<Self, Nip26Error> {
        let mut kind: Option<u32> = None;
        let mut since: Option<u64> = None;
        let mut until: Option<u64> = None;
        for clause in raw.split('&') {
            if let Some(value) = clause.strip_prefix("kind=") {
                if kind.replace(parse_positive(value)? as u32).is_some() {
                    return Err(Nip26Error::ClauseCount("kind"));
                }
            } else if let Some(value) = clause.strip_prefix("created_at>") {
                if since.replace(parse_positive(value)?).is_some() {
                    return Err(Nip26Error::ClauseCount("created_at>"));
                }
            } else if let Some(value) = clause.strip_prefix("created_at<") {
                if until.replace(parse_positive(value)?).is_some() {
                    return Err(Nip26Error::ClauseCount("created_at<"));
                }
            } else {
                return Err(Nip26Error::UnknownClause(clause.to_string()));
            }
        }
        let kind = kind.ok_or(Nip26Error::ClauseCount("kind"))?;
        let since = UnixTimestamp(since.ok_or(Nip26Error::ClauseCount("created_at>"))?);
        let until = UnixTimestamp(until.ok_or(Nip26Error::ClauseCount("created_at<"))?);
        if since >= until {
            return Err(Nip26Error::EmptyWindow);
        }
        Ok(Conditions {
            kind,
            since,
            until,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check an event's kind and timestamp against the delegated window.
    pub fn permits(&self, kind: u32, created_at: UnixTimestamp) -> Result<(), Nip26Error> {
        if kind != self.kind {
            return Err(Nip26Error::KindOutsideConditions(kind));
        }
        if created_at <= self.since || created_at >= self.until {
            return Err(Nip26Error::TimeOutsideConditions(created_at));
        }
        Ok(())
    }
}

fn parse_positive(value: &str) -> Result<u64, Nip26Error> {
    let n: u64 = value
        .parse()
        .map_err(|_| Nip26Error::BadValue(value.to_string()))?;
    if n == 0 {
        return Err(Nip26Error::BadValue(value.to_string()));
    }
    Ok(n)
}

/// The string whose SHA-256 the delegation token signs.
pub fn delegation_string(delegatee: &PublicKey, conditions: &str) -> String {
    format!("nostr:delegation:{delegatee}:{conditions}")
}

/// Verify a delegation token: `delegator` signed the delegation string for
/// `delegatee` under `conditions`.
pub fn verify_token(
    delegator: &PublicKey,
    delegatee: &PublicKey,
    conditions: &str,
    token_hex: &str,
) -> Result<(), Nip26Error> {
    let digest: [u8; 32] = Sha256::digest(delegation_string(delegatee, conditions).as_bytes()).into();
    let sig_bytes: [u8; 64] = hex::decode(token_hex)
        .map_err(|e| Nip26Error::MalformedToken(e.to_string()))?
        .try_into()
        .map_err(|_| Nip26Error::MalformedToken("expected 64 bytes".to_string()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip26Error::MalformedToken(e.to_string()))?;
    let xonly = XOnlyPublicKey::from_slice(delegator.as_bytes())
        .map_err(|e| Nip26Error::MalformedToken(e.to_string()))?;
    SECP256K1
        .verify_schnorr(&sig, &Message::from_digest(digest), &xonly)
        .map_err(|_| Nip26Error::InvalidToken)
}

/// Sign a delegation token as `delegator_secret`. Counterpart of
/// [`verify_token`]; used by provisioning tools and tests.
pub fn sign_token(delegator_secret: &SecretKey, delegatee: &PublicKey, conditions: &str) -> String {
    let digest: [u8; 32] = Sha256::digest(delegation_string(delegatee, conditions).as_bytes()).into();
    let keypair = Keypair::from_secret_key(SECP256K1, delegator_secret);
    let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
    sig.to_string()
}
