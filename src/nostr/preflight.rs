//! Shared validation for every inbound signed event, whether it arrives as
//! an HTTP body or over the subscription loop.

use crate::nostr::event::{Event, EventError};
use crate::nostr::nip26::{self, Conditions, Nip26Error};
use crate::timestamp::UnixTimestamp;
use crate::types::PublicKey;

/// Maximum accepted age of an inbound event.
pub const MAX_EVENT_AGE_SECS: u64 = 180;

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Delegation(#[from] Nip26Error),
    #[error("event is older than {MAX_EVENT_AGE_SECS} seconds")]
    Stale,
    #[error("event author {actual} does not match the expected key")]
    UnexpectedAuthor { actual: PublicKey },
}

/// Validate an inbound event and resolve its effective author.
///
/// Checks the Schnorr signature over the canonical id and the event age.
/// If the event carries a NIP-26 `delegation` tag, the token is verified
/// (the tag's conditions must also permit the event's kind and timestamp)
/// and the event's `pubkey` is rewritten to the delegator, so callers
/// always see the key that actually authorized the event.
pub fn preflight(
    event: &Event,
    now: UnixTimestamp,
    expected_author: Option<&PublicKey>,
) -> Result<Event, PreflightError> {
    event.verify_signature()?;
    if event.created_at.is_older_than(MAX_EVENT_AGE_SECS, now) {
        return Err(PreflightError::Stale);
    }
    let mut resolved = event.clone();
    if let Some((delegator, conditions, token)) = event.delegation_tag() {
        let conditions_parsed = Conditions::parse(&conditions)?;
        conditions_parsed.permits(event.kind, event.created_at)?;
        nip26::verify_token(&delegator, &event.pubkey, &conditions, &token)?;
        resolved.pubkey = delegator;
    }
    if let Some(expected) = expected_author {
        if resolved.pubkey != *expected {
            return Err(PreflightError::UnexpectedAuthor {
                actual: resolved.pubkey,
            });
        }
    }
    Ok(resolved)
}
