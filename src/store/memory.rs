//! In-process registry implementation.
//!
//! All entity tables live behind a single async mutex, which makes every
//! trait operation a serializable transaction. Subscription watermarks sit
//! outside the mutex in a [`DashMap`]: they are single-key counters with no
//! cross-entity invariants.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{
    Card, ConfigChange, Delegation, Design, DesignRef, Holder, Limit, NewCard, Ntag, Payment,
    PaymentRequest, PaymentStatus, ResetToken,
};
use super::{Store, StoreError};
use crate::timestamp::UnixTimestamp;
use crate::types::{CardId, PublicKey};

#[derive(Default)]
struct Inner {
    designs: HashMap<Uuid, Design>,
    design_by_name: HashMap<String, Uuid>,
    merchants: HashSet<PublicKey>,
    ntags: HashMap<CardId, Ntag>,
    otc_index: HashMap<String, CardId>,
    holders: HashMap<PublicKey, Holder>,
    cards: HashMap<Uuid, Card>,
    card_by_cid: HashMap<CardId, Uuid>,
    limits: HashMap<Uuid, Vec<Limit>>,
    payments: Vec<Payment>,
    payment_requests: HashMap<Uuid, PaymentRequest>,
    consumed_requests: HashSet<Uuid>,
    reset_tokens: HashMap<String, ResetToken>,
    reset_by_holder: HashMap<PublicKey, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    watermarks: DashMap<String, UnixTimestamp>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_design(&self, design: Design) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.design_by_name.insert(design.name.clone(), design.uuid);
        inner.designs.insert(design.uuid, design);
        Ok(())
    }

    async fn design(&self, uuid: &Uuid) -> Result<Option<Design>, StoreError> {
        Ok(self.inner.lock().await.designs.get(uuid).cloned())
    }

    async fn design_by_ref(&self, design_ref: &DesignRef) -> Result<Option<Design>, StoreError> {
        let inner = self.inner.lock().await;
        let uuid = match design_ref {
            DesignRef::ByUuid { uuid } => Some(*uuid),
            DesignRef::ByName { name } => inner.design_by_name.get(name).copied(),
        };
        Ok(uuid.and_then(|u| inner.designs.get(&u).cloned()))
    }

    async fn register_merchant(&self, pubkey: PublicKey) -> Result<(), StoreError> {
        self.inner.lock().await.merchants.insert(pubkey);
        Ok(())
    }

    async fn is_known_merchant(&self, pubkey: &PublicKey) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.merchants.contains(pubkey))
    }

    async fn create_ntag(&self, ntag: Ntag) -> Result<Ntag, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.ntags.contains_key(&ntag.cid) {
            return Err(StoreError::DuplicateCid(ntag.cid));
        }
        if !inner.designs.contains_key(&ntag.design_uuid) {
            return Err(StoreError::DesignNotFound);
        }
        inner.ntags.insert(ntag.cid, ntag.clone());
        Ok(ntag)
    }

    async fn ntag_by_cid(&self, cid: &CardId) -> Result<Option<Ntag>, StoreError> {
        Ok(self.inner.lock().await.ntags.get(cid).cloned())
    }

    async fn advance_ntag_counter(&self, cid: &CardId, counter: u32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let ntag = inner.ntags.get_mut(cid).ok_or(StoreError::NotFound)?;
        if ntag.ctr >= counter {
            return Ok(false);
        }
        ntag.ctr = counter;
        Ok(true)
    }

    async fn set_otc(&self, cid: &CardId, otc: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing_cid) = inner.otc_index.get(otc) {
            if existing_cid != cid {
                return Err(StoreError::OtcTaken {
                    otc: otc.to_string(),
                    existing: *existing_cid,
                    requested: *cid,
                });
            }
        }
        let existing = inner
            .ntags
            .get(cid)
            .ok_or(StoreError::NotFound)?
            .otc
            .clone();
        match existing {
            Some(existing) if existing == otc => Ok(()),
            Some(existing) => Err(StoreError::OtcConflict {
                cid: *cid,
                existing,
                requested: otc.to_string(),
            }),
            None => {
                inner.ntags.get_mut(cid).expect("present above").otc = Some(otc.to_string());
                inner.otc_index.insert(otc.to_string(), *cid);
                Ok(())
            }
        }
    }

    async fn ntag_by_otc(&self, otc: &str) -> Result<Option<Ntag>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .otc_index
            .get(otc)
            .and_then(|cid| inner.ntags.get(cid).cloned()))
    }

    async fn available_ntag_by_otc(&self, otc: &str) -> Result<Option<Ntag>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(cid) = inner.otc_index.get(otc) else {
            return Ok(None);
        };
        if inner.card_by_cid.contains_key(cid) {
            return Ok(None);
        }
        Ok(inner.ntags.get(cid).cloned())
    }

    async fn delete_ntag(&self, cid: &CardId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.card_by_cid.contains_key(cid) {
            return Err(StoreError::NtagInUse(*cid));
        }
        let ntag = inner.ntags.remove(cid).ok_or(StoreError::NotFound)?;
        if let Some(otc) = ntag.otc {
            inner.otc_index.remove(&otc);
        }
        Ok(())
    }

    async fn upsert_holder(
        &self,
        pubkey: PublicKey,
        delegation: Delegation,
        default_merchants: &[PublicKey],
    ) -> Result<Holder, StoreError> {
        let mut inner = self.inner.lock().await;
        let holder = inner.holders.entry(pubkey).or_insert_with(|| Holder {
            pub_key: pubkey,
            delegations: Vec::new(),
            trusted_merchants: Vec::new(),
        });
        if !holder
            .delegations
            .iter()
            .any(|d| d.delegation_token == delegation.delegation_token)
        {
            holder.delegations.push(delegation);
        }
        for merchant in default_merchants {
            if !holder.trusted_merchants.contains(merchant) {
                holder.trusted_merchants.push(*merchant);
            }
        }
        Ok(holder.clone())
    }

    async fn holder(&self, pubkey: &PublicKey) -> Result<Option<Holder>, StoreError> {
        Ok(self.inner.lock().await.holders.get(pubkey).cloned())
    }

    async fn current_delegation(
        &self,
        holder: &PublicKey,
        now: UnixTimestamp,
    ) -> Result<Option<Delegation>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.holders.get(holder).and_then(|h| {
            h.delegations
                .iter()
                .filter(|d| d.is_current(now))
                .max_by_key(|d| d.until)
                .cloned()
        }))
    }

    async fn create_card(&self, new_card: NewCard) -> Result<Card, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.ntags.contains_key(&new_card.ntag_cid) {
            return Err(StoreError::NotFound);
        }
        if inner.card_by_cid.contains_key(&new_card.ntag_cid) {
            return Err(StoreError::CardExists(new_card.ntag_cid));
        }
        if !inner.holders.contains_key(&new_card.holder) {
            return Err(StoreError::NotFound);
        }
        let card = Card {
            uuid: Uuid::new_v4(),
            name: new_card.name,
            description: new_card.description,
            enabled: true,
            ntag424_cid: new_card.ntag_cid,
            holder_pub_key: Some(new_card.holder),
        };
        let limits = new_card
            .limits
            .into_iter()
            .map(|l| Limit {
                uuid: Uuid::new_v4(),
                card_uuid: card.uuid,
                name: l.name,
                description: l.description,
                token: l.token,
                amount: l.amount,
                delta: l.delta,
            })
            .collect();
        inner.limits.insert(card.uuid, limits);
        inner.card_by_cid.insert(card.ntag424_cid, card.uuid);
        inner.cards.insert(card.uuid, card.clone());
        Ok(card)
    }

    async fn card(&self, uuid: &Uuid) -> Result<Option<Card>, StoreError> {
        Ok(self.inner.lock().await.cards.get(uuid).cloned())
    }

    async fn card_by_cid(&self, cid: &CardId) -> Result<Option<Card>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .card_by_cid
            .get(cid)
            .and_then(|uuid| inner.cards.get(uuid).cloned()))
    }

    async fn cards_by_holder(&self, holder: &PublicKey) -> Result<Vec<Card>, StoreError> {
        let inner = self.inner.lock().await;
        let mut cards: Vec<Card> = inner
            .cards
            .values()
            .filter(|c| c.holder_pub_key.as_ref() == Some(holder))
            .cloned()
            .collect();
        cards.sort_by_key(|c| c.uuid);
        Ok(cards)
    }

    async fn transfer_card(
        &self,
        uuid: &Uuid,
        from: &PublicKey,
        to: &PublicKey,
    ) -> Result<Card, StoreError> {
        let mut inner = self.inner.lock().await;
        let card = inner.cards.get_mut(uuid).ok_or(StoreError::NotFound)?;
        if card.holder_pub_key.as_ref() != Some(from) {
            return Err(StoreError::NotFound);
        }
        card.enabled = false;
        card.holder_pub_key = Some(*to);
        Ok(card.clone())
    }

    async fn reassign_cards(&self, from: &PublicKey, to: &PublicKey) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut moved = 0;
        for card in inner.cards.values_mut() {
            if card.holder_pub_key.as_ref() == Some(from) {
                card.holder_pub_key = Some(*to);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn apply_config(
        &self,
        holder: &PublicKey,
        change: ConfigChange,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.holders.contains_key(holder) {
            return Err(StoreError::NotFound);
        }
        // Unknown merchants are silently dropped.
        let merchants: Vec<PublicKey> = change
            .trusted_merchants
            .into_iter()
            .filter(|m| inner.merchants.contains(m))
            .collect();
        inner
            .holders
            .get_mut(holder)
            .expect("checked above")
            .trusted_merchants = merchants;

        for (card_uuid, patch) in change.cards {
            let Some(card) = inner.cards.get_mut(&card_uuid) else {
                continue;
            };
            if card.holder_pub_key.as_ref() != Some(holder) {
                continue;
            }
            if let Some(name) = patch.name {
                card.name = name;
            }
            if let Some(description) = patch.description {
                card.description = description;
            }
            if let Some(enabled) = patch.enabled {
                card.enabled = enabled;
            }
            let limits = patch
                .limits
                .into_iter()
                .map(|l| Limit {
                    uuid: Uuid::new_v4(),
                    card_uuid,
                    name: l.name,
                    description: l.description,
                    token: l.token,
                    amount: l.amount,
                    delta: l.delta,
                })
                .collect();
            inner.limits.insert(card_uuid, limits);
        }
        Ok(())
    }

    async fn limits_for_card(&self, card_uuid: &Uuid) -> Result<Vec<Limit>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .limits
            .get(card_uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn payments_total_since(
        &self,
        card_uuid: &Uuid,
        token: &str,
        since: UnixTimestamp,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .filter(|p| {
                p.card_uuid == *card_uuid
                    && p.token == token
                    && p.status == PaymentStatus::Confirmed
                    && p.created_at >= since
            })
            .map(|p| p.amount)
            .sum())
    }

    async fn insert_payment_request(&self, request: PaymentRequest) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .payment_requests
            .insert(request.uuid, request);
        Ok(())
    }

    async fn payment_request(&self, uuid: &Uuid) -> Result<Option<PaymentRequest>, StoreError> {
        Ok(self.inner.lock().await.payment_requests.get(uuid).cloned())
    }

    async fn is_payment_request_consumed(&self, uuid: &Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.consumed_requests.contains(uuid))
    }

    async fn consume_payment_request(
        &self,
        uuid: &Uuid,
        payments: Vec<Payment>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.payment_requests.contains_key(uuid) {
            return Err(StoreError::NotFound);
        }
        if !inner.consumed_requests.insert(*uuid) {
            return Err(StoreError::AlreadyUsed);
        }
        inner.payments.extend(payments);
        Ok(())
    }

    async fn upsert_reset_token(&self, token: ResetToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner
            .reset_by_holder
            .insert(token.holder_pub_key, token.token.clone())
        {
            inner.reset_tokens.remove(&previous);
        }
        inner.reset_tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn take_reset_token(&self, token: &str) -> Result<Option<ResetToken>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(reset) = inner.reset_tokens.remove(token) else {
            return Ok(None);
        };
        inner.reset_by_holder.remove(&reset.holder_pub_key);
        Ok(Some(reset))
    }

    async fn high_watermark(
        &self,
        subscription: &str,
    ) -> Result<Option<UnixTimestamp>, StoreError> {
        Ok(self.watermarks.get(subscription).map(|e| *e.value()))
    }

    async fn set_high_watermark(
        &self,
        subscription: &str,
        created_at: UnixTimestamp,
    ) -> Result<(), StoreError> {
        self.watermarks
            .entry(subscription.to_string())
            .and_modify(|w| *w = (*w).max(created_at))
            .or_insert(created_at);
        Ok(())
    }
}
