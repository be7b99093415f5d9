//! Encrypted configuration channel between the module and each holder.
//!
//! Two document kinds flow as multi-recipient NIP-04 envelopes on
//! parameterized-replaceable events, keyed per holder via the `d` tag:
//!
//! - **card-data** (module → holder): which cards the holder owns and
//!   their designs. Informational; holders cannot change it.
//! - **card-config** (holder → module, republished by the module as
//!   confirmation): names, enablement, limits, and trusted merchants.
//!
//! Inbound `card-config-change` events are decrypted, validated strictly,
//! and applied in a single registry transaction; the module then publishes
//! the resulting card-config back, e-tagged to the request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

use crate::app::AppState;
use crate::nostr::envelope::{self, EnvelopeError};
use crate::nostr::event::{kinds, topics};
use crate::nostr::{Event, nip04};
use crate::outbox::OutboxError;
use crate::store::StoreError;
use crate::store::model::{CardPatch, ConfigChange, Design, NewLimit};
use crate::timestamp::UnixTimestamp;
use crate::types::PublicKey;

#[derive(Debug, thiserror::Error)]
pub enum ConfigChannelError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Nip04(#[from] nip04::Nip04Error),
    #[error("config document malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error("holder unknown")]
    HolderUnknown,
}

/// `card-data` document: card uuid → design.
pub type CardDataDocument = BTreeMap<Uuid, CardDataEntry>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardDataEntry {
    pub design: Design,
}

/// `card-config` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct CardConfigDocument {
    #[serde(rename = "trusted-merchants")]
    pub trusted_merchants: Vec<MerchantRef>,
    pub cards: BTreeMap<Uuid, CardConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MerchantRef {
    pub pubkey: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct CardConfigEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    #[serde(default)]
    pub limits: Vec<NewLimit>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardStatus {
    Enabled,
    Disabled,
}

/// Assemble the current card-data document for a holder.
pub async fn build_card_data_document(
    state: &AppState,
    holder: &PublicKey,
) -> Result<CardDataDocument, ConfigChannelError> {
    let cards = state.store.cards_by_holder(holder).await?;
    let mut document = CardDataDocument::new();
    for card in cards {
        let ntag = state
            .store
            .ntag_by_cid(&card.ntag424_cid)
            .await?
            .ok_or(StoreError::NotFound)?;
        let design = state
            .store
            .design(&ntag.design_uuid)
            .await?
            .ok_or(StoreError::DesignNotFound)?;
        document.insert(card.uuid, CardDataEntry { design });
    }
    Ok(document)
}

/// Assemble the current card-config document for a holder.
pub async fn build_card_config_document(
    state: &AppState,
    holder: &PublicKey,
) -> Result<CardConfigDocument, ConfigChannelError> {
    let holder_row = state
        .store
        .holder(holder)
        .await?
        .ok_or(ConfigChannelError::HolderUnknown)?;
    let mut document = CardConfigDocument {
        trusted_merchants: holder_row
            .trusted_merchants
            .iter()
            .map(|pubkey| MerchantRef { pubkey: *pubkey })
            .collect(),
        cards: BTreeMap::new(),
    };
    for card in state.store.cards_by_holder(holder).await? {
        let limits = state
            .store
            .limits_for_card(&card.uuid)
            .await?
            .into_iter()
            .map(|l| NewLimit {
                name: l.name,
                description: l.description,
                token: l.token,
                amount: l.amount,
                delta: l.delta,
            })
            .collect();
        document.cards.insert(
            card.uuid,
            CardConfigEntry {
                name: Some(card.name.clone()),
                description: Some(card.description.clone()),
                status: Some(if card.enabled {
                    CardStatus::Enabled
                } else {
                    CardStatus::Disabled
                }),
                limits,
            },
        );
    }
    Ok(document)
}

fn replaceable_tags(topic: &str, holder: &PublicKey, reply_to: Option<&str>) -> Vec<Vec<String>> {
    let mut tags = vec![
        vec!["t".to_string(), topic.to_string()],
        vec!["d".to_string(), format!("{holder}:{topic}")],
        vec!["p".to_string(), holder.to_hex()],
    ];
    if let Some(event_id) = reply_to {
        tags.push(vec!["e".to_string(), event_id.to_string()]);
    }
    tags
}

/// Seal a document for the module and the holder and publish it on a
/// replaceable event.
async fn publish_document(
    state: &AppState,
    holder: &PublicKey,
    topic: &str,
    document_json: String,
    reply_to: Option<&str>,
    now: UnixTimestamp,
) -> Result<Event, ConfigChannelError> {
    let recipients = [state.config.nostr_public_key, *holder];
    let content = envelope::seal(&state.config.nostr_secret_key, &document_json, &recipients)?;
    let event = state.sign(
        kinds::REPLACEABLE_CONFIG,
        replaceable_tags(topic, holder, reply_to),
        content,
        now,
    );
    state.outbox.publish(event.clone()).await?;
    Ok(event)
}

/// Publish the holder's card-data document.
#[instrument(skip_all, err, fields(holder = %holder))]
pub async fn publish_card_data(
    state: &AppState,
    holder: &PublicKey,
    now: UnixTimestamp,
) -> Result<Event, ConfigChannelError> {
    let document = build_card_data_document(state, holder).await?;
    let json = serde_json::to_string(&document)?;
    publish_document(state, holder, topics::CARD_DATA, json, None, now).await
}

/// Publish the holder's card-config document, optionally e-tagged to the
/// config-change event it confirms.
#[instrument(skip_all, err, fields(holder = %holder))]
pub async fn publish_card_config(
    state: &AppState,
    holder: &PublicKey,
    reply_to: Option<&str>,
    now: UnixTimestamp,
) -> Result<Event, ConfigChannelError> {
    let document = build_card_config_document(state, holder).await?;
    let json = serde_json::to_string(&document)?;
    publish_document(state, holder, topics::CARD_CONFIG, json, reply_to, now).await
}

/// Decrypt the content of a holder-authored config event, accepting both
/// the multi-recipient envelope and a direct NIP-04 payload.
fn decrypt_inbound(state: &AppState, event: &Event) -> Result<String, ConfigChannelError> {
    let me = state.config.nostr_public_key;
    match envelope::open(
        &state.config.nostr_secret_key,
        &me,
        &event.pubkey,
        &event.content,
    ) {
        Ok(plain) => Ok(plain),
        Err(EnvelopeError::Json(_)) => Ok(nip04::decrypt(
            &state.config.nostr_secret_key,
            &event.pubkey,
            &event.content,
        )?),
        Err(other) => Err(other.into()),
    }
}

/// Apply an inbound `card-config-change` event.
///
/// The event must already have passed the signed-event preflight; its
/// `pubkey` is the holder whose configuration changes. The whole change is
/// one registry transaction, after which the module republishes the
/// holder's card-config as confirmation.
#[instrument(skip_all, err, fields(holder = %event.pubkey, event = %event.id))]
pub async fn apply_config_change(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<(), ConfigChannelError> {
    let holder = event.pubkey;
    if state.store.holder(&holder).await?.is_none() {
        return Err(ConfigChannelError::HolderUnknown);
    }
    let plain = decrypt_inbound(state, event)?;
    let document: CardConfigDocument = serde_json::from_str(&plain)?;

    let change = ConfigChange {
        trusted_merchants: document
            .trusted_merchants
            .iter()
            .map(|m| m.pubkey)
            .collect(),
        cards: document
            .cards
            .into_iter()
            .map(|(uuid, entry)| {
                (
                    uuid,
                    CardPatch {
                        name: entry.name,
                        description: entry.description,
                        enabled: entry.status.map(|s| s == CardStatus::Enabled),
                        limits: entry.limits,
                    },
                )
            })
            .collect(),
    };
    state.store.apply_config(&holder, change).await?;
    publish_card_config(state, &holder, Some(&event.id), now).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::EventTemplate;
    use crate::testing;

    #[tokio::test]
    async fn test_card_config_document_roundtrip() {
        let json = r#"{
            "trusted-merchants": [{"pubkey": "1111111111111111111111111111111111111111111111111111111111111111"}],
            "cards": {
                "6ba7b810-9dad-11d1-80b4-00c04fd430c8": {
                    "name": "groceries",
                    "status": "DISABLED",
                    "limits": [
                        {"name": "daily", "description": "", "token": "BTC", "amount": 1000000, "delta": 86400}
                    ]
                }
            }
        }"#;
        let document: CardConfigDocument = serde_json::from_str(json).unwrap();
        assert_eq!(document.trusted_merchants.len(), 1);
        let entry = document.cards.values().next().unwrap();
        assert_eq!(entry.name.as_deref(), Some("groceries"));
        assert_eq!(entry.description, None);
        assert_eq!(entry.status, Some(CardStatus::Disabled));
        assert_eq!(entry.limits[0].amount, 1_000_000);
        // Round-trip through the wire form.
        let back: CardConfigDocument =
            serde_json::from_str(&serde_json::to_string(&document).unwrap()).unwrap();
        assert_eq!(back, document);
    }

    #[tokio::test]
    async fn test_unknown_critical_field_rejected() {
        let json = r#"{"trusted-merchants": [], "cards": {}, "extra": 1}"#;
        assert!(serde_json::from_str::<CardConfigDocument>(json).is_err());
    }

    #[tokio::test]
    async fn test_publish_and_apply_roundtrip() {
        let harness = testing::Harness::new().await;
        let holder = harness.activate_default_card().await;
        let state = &harness.state;

        // The published card-data names the activated card's design.
        let data_event = publish_card_data(state, &holder.pubkey, harness.now())
            .await
            .unwrap();
        assert_eq!(data_event.kind, kinds::REPLACEABLE_CONFIG);
        assert_eq!(data_event.topic(), Some(topics::CARD_DATA));
        assert_eq!(
            data_event.tag_value("d").unwrap(),
            format!("{}:card-data", holder.pubkey)
        );
        let plain = envelope::open(
            &holder.secret,
            &holder.pubkey,
            &state.config.nostr_public_key,
            &data_event.content,
        )
        .unwrap();
        let document: CardDataDocument = serde_json::from_str(&plain).unwrap();
        assert_eq!(document.len(), 1);
        assert_eq!(document.values().next().unwrap().design.name, "To the moon");

        // The holder renames the card, disables it, and tightens limits.
        let card = harness.only_card(&holder.pubkey).await;
        let mut change = CardConfigDocument::default();
        change.cards.insert(
            card.uuid,
            CardConfigEntry {
                name: Some("renamed".to_string()),
                description: None,
                status: Some(CardStatus::Disabled),
                limits: vec![NewLimit {
                    name: "tight".to_string(),
                    description: String::new(),
                    token: "BTC".to_string(),
                    amount: 1_000,
                    delta: 60,
                }],
            },
        );
        let content = nip04::encrypt(
            &holder.secret,
            &state.config.nostr_public_key,
            &serde_json::to_string(&change).unwrap(),
        )
        .unwrap();
        let event = Event::finalize(
            EventTemplate {
                created_at: harness.now(),
                kind: kinds::TRANSACTION,
                tags: vec![
                    vec!["t".to_string(), topics::CARD_CONFIG_CHANGE.to_string()],
                    vec!["p".to_string(), state.config.nostr_public_key.to_hex()],
                ],
                content,
            },
            &holder.secret,
        );
        apply_config_change(state, &event, harness.now()).await.unwrap();

        let updated = state.store.card(&card.uuid).await.unwrap().unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(!updated.enabled);
        let limits = state.store.limits_for_card(&card.uuid).await.unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].amount, 1_000);

        // A confirming card-config event went out, e-tagged to the change.
        let published = harness.bus.published().await;
        let confirmation = published
            .iter()
            .rev()
            .find(|e| e.topic() == Some(topics::CARD_CONFIG))
            .unwrap();
        assert_eq!(confirmation.tag_value("e").unwrap(), event.id);
        let plain = envelope::open(
            &holder.secret,
            &holder.pubkey,
            &state.config.nostr_public_key,
            &confirmation.content,
        )
        .unwrap();
        let confirmed: CardConfigDocument = serde_json::from_str(&plain).unwrap();
        assert_eq!(
            confirmed.cards[&card.uuid].name.as_deref(),
            Some("renamed")
        );
        assert_eq!(
            confirmed.cards[&card.uuid].status,
            Some(CardStatus::Disabled)
        );
    }

    #[tokio::test]
    async fn test_apply_rejects_unknown_holder() {
        let harness = testing::Harness::new().await;
        let state = &harness.state;
        let stranger_sk = secp256k1::SecretKey::from_slice(&[0x99; 32]).unwrap();
        let content = nip04::encrypt(
            &stranger_sk,
            &state.config.nostr_public_key,
            "{\"trusted-merchants\":[],\"cards\":{}}",
        )
        .unwrap();
        let event = Event::finalize(
            EventTemplate {
                created_at: harness.now(),
                kind: kinds::TRANSACTION,
                tags: vec![vec![
                    "t".to_string(),
                    topics::CARD_CONFIG_CHANGE.to_string(),
                ]],
                content,
            },
            &stranger_sk,
        );
        assert!(matches!(
            apply_config_change(state, &event, harness.now()).await,
            Err(ConfigChannelError::HolderUnknown)
        ));
    }
}
