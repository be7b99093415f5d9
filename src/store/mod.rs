//! The card registry: an abstract transactional store owning every entity
//! of the module.
//!
//! Each trait method is one transaction; callers never compose partial
//! writes. [`MemoryStore`](memory::MemoryStore) is the in-process
//! implementation; a relational backend would implement the same trait and
//! map each operation onto a database transaction (or an equivalent
//! conditional update).

pub mod memory;
pub mod model;

use async_trait::async_trait;
use uuid::Uuid;

use crate::timestamp::UnixTimestamp;
use crate::types::{CardId, PublicKey};
use model::{
    Card, ConfigChange, Delegation, Design, DesignRef, Holder, NewCard, Ntag, Payment,
    PaymentRequest, ResetToken,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("ntag {0} already exists")]
    DuplicateCid(CardId),
    #[error("design not found")]
    DesignNotFound,
    #[error("ntag {cid} is already associated to a different code")]
    OtcConflict {
        cid: CardId,
        existing: String,
        requested: String,
    },
    #[error("association code is already bound to ntag {existing}")]
    OtcTaken {
        otc: String,
        existing: CardId,
        requested: CardId,
    },
    #[error("ntag {0} already has a card")]
    CardExists(CardId),
    #[error("ntag {0} is referenced by a card")]
    NtagInUse(CardId),
    #[error("payment request already used")]
    AlreadyUsed,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Transactional operations of the card registry.
#[async_trait]
pub trait Store: Send + Sync {
    // Designs.
    async fn insert_design(&self, design: Design) -> Result<(), StoreError>;
    async fn design(&self, uuid: &Uuid) -> Result<Option<Design>, StoreError>;
    async fn design_by_ref(&self, design_ref: &DesignRef) -> Result<Option<Design>, StoreError>;

    // Known-merchant registry.
    async fn register_merchant(&self, pubkey: PublicKey) -> Result<(), StoreError>;
    async fn is_known_merchant(&self, pubkey: &PublicKey) -> Result<bool, StoreError>;

    // NTAGs.
    /// Insert a new NTAG record. Fails with [`StoreError::DuplicateCid`] if
    /// the cid is taken.
    async fn create_ntag(&self, ntag: Ntag) -> Result<Ntag, StoreError>;
    async fn ntag_by_cid(&self, cid: &CardId) -> Result<Option<Ntag>, StoreError>;
    /// Conditionally advance the tap counter. Returns `false` when the
    /// stored counter is already `>= counter`; the caller treats that as a
    /// replay.
    async fn advance_ntag_counter(&self, cid: &CardId, counter: u32) -> Result<bool, StoreError>;
    /// Bind a one-time association code. Idempotent for the same code;
    /// conflicts when either side is already bound elsewhere.
    async fn set_otc(&self, cid: &CardId, otc: &str) -> Result<(), StoreError>;
    async fn ntag_by_otc(&self, otc: &str) -> Result<Option<Ntag>, StoreError>;
    /// NTAG bound to `otc` that has no card yet.
    async fn available_ntag_by_otc(&self, otc: &str) -> Result<Option<Ntag>, StoreError>;
    async fn delete_ntag(&self, cid: &CardId) -> Result<(), StoreError>;

    // Holders.
    /// Create the holder with the delegation and default merchants, or add
    /// the delegation (if new) and union the merchant set.
    async fn upsert_holder(
        &self,
        pubkey: PublicKey,
        delegation: Delegation,
        default_merchants: &[PublicKey],
    ) -> Result<Holder, StoreError>;
    async fn holder(&self, pubkey: &PublicKey) -> Result<Option<Holder>, StoreError>;
    /// The delegation whose window contains `now`, preferring the one that
    /// expires last.
    async fn current_delegation(
        &self,
        holder: &PublicKey,
        now: UnixTimestamp,
    ) -> Result<Option<Delegation>, StoreError>;

    // Cards.
    async fn create_card(&self, new_card: NewCard) -> Result<Card, StoreError>;
    async fn card(&self, uuid: &Uuid) -> Result<Option<Card>, StoreError>;
    async fn card_by_cid(&self, cid: &CardId) -> Result<Option<Card>, StoreError>;
    async fn cards_by_holder(&self, holder: &PublicKey) -> Result<Vec<Card>, StoreError>;
    /// Atomic transfer: disables the card and rebinds the holder. Fails
    /// with [`StoreError::NotFound`] unless `(uuid, from)` matches.
    async fn transfer_card(
        &self,
        uuid: &Uuid,
        from: &PublicKey,
        to: &PublicKey,
    ) -> Result<Card, StoreError>;
    /// Rebind every card of `from` to `to` (admin reset). Returns the
    /// number of cards moved.
    async fn reassign_cards(&self, from: &PublicKey, to: &PublicKey) -> Result<usize, StoreError>;

    /// Apply a holder-declared configuration change in one transaction:
    /// replace trusted merchants (already filtered to known ones by the
    /// caller of record — unknown keys are dropped here as well) and patch
    /// each card the holder owns.
    async fn apply_config(
        &self,
        holder: &PublicKey,
        change: ConfigChange,
    ) -> Result<(), StoreError>;

    // Limits and payments.
    async fn limits_for_card(&self, card_uuid: &Uuid) -> Result<Vec<model::Limit>, StoreError>;
    /// Sum of confirmed payment amounts for `(card, token)` with
    /// `created_at >= since`.
    async fn payments_total_since(
        &self,
        card_uuid: &Uuid,
        token: &str,
        since: UnixTimestamp,
    ) -> Result<u64, StoreError>;

    // Payment requests.
    async fn insert_payment_request(&self, request: PaymentRequest) -> Result<(), StoreError>;
    async fn payment_request(&self, uuid: &Uuid) -> Result<Option<PaymentRequest>, StoreError>;
    async fn is_payment_request_consumed(&self, uuid: &Uuid) -> Result<bool, StoreError>;
    /// Mark a payment request consumed by inserting the payments that
    /// reference it, atomically. Fails with [`StoreError::AlreadyUsed`] if
    /// any payment already references it.
    async fn consume_payment_request(
        &self,
        uuid: &Uuid,
        payments: Vec<Payment>,
    ) -> Result<(), StoreError>;

    // Reset tokens.
    /// Upsert the reset token for a holder (one per holder).
    async fn upsert_reset_token(&self, token: ResetToken) -> Result<(), StoreError>;
    /// Fetch and delete in one step. The token is gone regardless of what
    /// the caller does next.
    async fn take_reset_token(&self, token: &str) -> Result<Option<ResetToken>, StoreError>;

    // Subscription high-watermarks.
    async fn high_watermark(
        &self,
        subscription: &str,
    ) -> Result<Option<UnixTimestamp>, StoreError>;
    async fn set_high_watermark(
        &self,
        subscription: &str,
        created_at: UnixTimestamp,
    ) -> Result<(), StoreError>;
}
