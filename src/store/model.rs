//! Entities owned by the card registry.
//!
//! Holder ← Card ← NTAG form a line graph: a holder owns cards, each card
//! wraps exactly one physical NTAG. Back-references are lookup-only; every
//! mutation goes through the [`Store`](super::Store) operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::nostr::nip26::{Conditions, Nip26Error};
use crate::timestamp::UnixTimestamp;
use crate::types::{AesKey, CardId, PublicKey};

/// A card theme selectable at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Design {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
}

/// Reference to a design, by unique name or by uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesignRef {
    ByUuid { uuid: Uuid },
    ByName { name: String },
}

/// The physical card's cryptographic identity.
///
/// `k1` is the module-wide SUN decryption key; the other four keys are
/// generated per card at initialization and handed back to the card writer
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ntag {
    pub cid: CardId,
    pub k0: AesKey,
    pub k1: AesKey,
    pub k2: AesKey,
    pub k3: AesKey,
    pub k4: AesKey,
    pub ctr: u32,
    pub otc: Option<String>,
    pub design_uuid: Uuid,
}

/// Lifecycle state of a physical NTAG, derived from its record and the
/// presence of an activated card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtagState {
    Initialized,
    Associated,
    Activated,
}

impl NtagState {
    pub fn derive(ntag: &Ntag, card: Option<&Card>) -> NtagState {
        match (&ntag.otc, card.and_then(|c| c.holder_pub_key.as_ref())) {
            (_, Some(_)) => NtagState::Activated,
            (Some(_), None) => NtagState::Associated,
            (None, None) => NtagState::Initialized,
        }
    }
}

/// The logical card a holder spends from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub ntag424_cid: CardId,
    pub holder_pub_key: Option<PublicKey>,
}

/// Inputs for creating a card in one transaction.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub ntag_cid: CardId,
    pub holder: PublicKey,
    pub name: String,
    pub description: String,
    pub limits: Vec<NewLimit>,
}

/// An end-user identity on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub pub_key: PublicKey,
    pub delegations: Vec<Delegation>,
    pub trusted_merchants: Vec<PublicKey>,
}

/// A NIP-26 delegation held on file for a holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    pub delegator_pub_key: PublicKey,
    pub conditions: String,
    pub delegation_token: String,
    pub since: UnixTimestamp,
    pub until: UnixTimestamp,
}

impl Delegation {
    /// Build a delegation record from its conditions string, deriving the
    /// validity window.
    pub fn from_conditions(
        delegator: PublicKey,
        conditions: &str,
        token: &str,
    ) -> Result<Self, Nip26Error> {
        let parsed = Conditions::parse(conditions)?;
        Ok(Delegation {
            delegator_pub_key: delegator,
            conditions: conditions.to_string(),
            delegation_token: token.to_string(),
            since: parsed.since,
            until: parsed.until,
        })
    }

    pub fn is_current(&self, now: UnixTimestamp) -> bool {
        self.since < now && now < self.until
    }
}

/// A per-card spending rule: at most `amount` of `token` per sliding
/// window of `delta` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limit {
    pub uuid: Uuid,
    pub card_uuid: Uuid,
    pub name: String,
    pub description: String,
    pub token: String,
    pub amount: u64,
    pub delta: u64,
}

/// Limit inputs before a uuid and card binding exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLimit {
    pub name: String,
    pub description: String,
    pub token: String,
    pub amount: u64,
    pub delta: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Confirmed,
    Failed,
}

/// A confirmed deduction against a card's limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub uuid: Uuid,
    pub card_uuid: Uuid,
    pub token: String,
    pub amount: u64,
    pub status: PaymentStatus,
    pub payment_request_uuid: Uuid,
    pub created_at: UnixTimestamp,
}

/// A single-use scan token, consumed by the first payment that references
/// it.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub uuid: Uuid,
    pub card_uuid: Uuid,
    /// The pre-rendered scan reply, without its `k1` field.
    pub response: serde_json::Value,
    pub created_at: UnixTimestamp,
}

/// Transient admin-issued reset nonce for a holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetToken {
    pub holder_pub_key: PublicKey,
    pub token: String,
    pub created_at: UnixTimestamp,
}

/// A holder-declared configuration change, already decrypted and validated,
/// applied in one registry transaction.
#[derive(Debug, Clone, Default)]
pub struct ConfigChange {
    pub trusted_merchants: Vec<PublicKey>,
    pub cards: BTreeMap<Uuid, CardPatch>,
}

/// Per-card part of a [`ConfigChange`].
#[derive(Debug, Clone, Default)]
pub struct CardPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub limits: Vec<NewLimit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegation_window_from_conditions() {
        let delegator: PublicKey = "ab".repeat(32).parse().unwrap();
        let delegation = Delegation::from_conditions(
            delegator,
            "kind=1112&created_at<1700762400&created_at>1698080400",
            "00".repeat(64).as_str(),
        )
        .unwrap();
        assert_eq!(delegation.since, UnixTimestamp(1698080400));
        assert_eq!(delegation.until, UnixTimestamp(1700762400));
        assert!(delegation.is_current(UnixTimestamp(1699000000)));
        assert!(!delegation.is_current(UnixTimestamp(1698080400)));
        assert!(!delegation.is_current(UnixTimestamp(1700762400)));
    }

    #[test]
    fn test_design_ref_wire_forms() {
        let by_name: DesignRef = serde_json::from_str("{\"name\":\"To the moon\"}").unwrap();
        assert_eq!(
            by_name,
            DesignRef::ByName {
                name: "To the moon".to_string()
            }
        );
        let uuid = Uuid::new_v4();
        let by_uuid: DesignRef =
            serde_json::from_str(&format!("{{\"uuid\":\"{uuid}\"}}")).unwrap();
        assert_eq!(by_uuid, DesignRef::ByUuid { uuid });
    }

    #[test]
    fn test_ntag_wire_is_camel_case() {
        let ntag = Ntag {
            cid: "f0da0000000010".parse().unwrap(),
            k0: AesKey([0u8; 16]),
            k1: AesKey([1u8; 16]),
            k2: AesKey([2u8; 16]),
            k3: AesKey([3u8; 16]),
            k4: AesKey([4u8; 16]),
            ctr: 0,
            otc: None,
            design_uuid: Uuid::nil(),
        };
        let value = serde_json::to_value(&ntag).unwrap();
        assert!(value.get("designUuid").is_some());
        assert_eq!(value["cid"], "f0da0000000010");
    }
}
