//! Card lifecycle orchestration: initialize → associate → activate, plus
//! holder-to-holder transfer and the admin reset saga.
//!
//! Every transition validates its signed request, runs one registry
//! transaction, and (where the lifecycle says so) publishes the refreshed
//! config documents. Reset claiming deletes the reset token before any
//! mutation; everything after that point is best-effort and reported
//! per-step to the caller.

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::app::AppState;
use crate::config_channel::{self, ConfigChannelError};
use crate::nostr::event::{kinds, topics};
use crate::nostr::nip04::Nip04Error;
use crate::nostr::nip26::{self, Nip26Error};
use crate::nostr::preflight::{PreflightError, preflight};
use crate::nostr::{Event, nip04};
use crate::outbox::OutboxError;
use crate::store::StoreError;
use crate::store::model::{Card, Delegation, DesignRef, NewCard, Ntag, ResetToken};
use crate::sun::{self, SunError};
use crate::suuid;
use crate::timestamp::UnixTimestamp;
use crate::types::{AesKey, CardId, PublicKey};

/// TTL of an admin-issued reset token.
pub const RESET_EXPIRY_SECS: u64 = 180;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error("malformed request content: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Delegation(#[from] Nip26Error),
    #[error(transparent)]
    Sun(#[from] SunError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ConfigChannelError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Nip04(#[from] Nip04Error),
    #[error("no card is available for this code")]
    NoAvailableNtag,
    #[error("reset token invalid or expired")]
    ResetTokenInvalid,
    #[error("admin authorization failed")]
    AdminRequired,
    #[error("target card may not belong to an admin")]
    TargetIsAdmin,
    #[error("admin and target card must differ")]
    SameCard,
    #[error("card is not activated")]
    NotActivated,
    #[error("donation event invalid: {0}")]
    BadDonation(String),
}

#[derive(Debug, Deserialize)]
struct InitializeContent {
    cid: CardId,
    ctr: u32,
    design: DesignRef,
}

#[derive(Debug, Deserialize)]
struct AssociateContent {
    otc: String,
}

#[derive(Debug, Deserialize)]
struct DelegationContent {
    conditions: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ActivateContent {
    otc: String,
    delegation: DelegationContent,
}

#[derive(Debug, Deserialize)]
struct TransferAcceptanceContent {
    delegation: DelegationContent,
    #[serde(rename = "donationEvent")]
    donation_event: Event,
}

#[derive(Debug, Deserialize)]
struct ResetClaimContent {
    otc: String,
    delegation: DelegationContent,
}

#[derive(Debug, Deserialize)]
struct DeleteContent {
    cid: CardId,
}

/// One `(p, c)` pair from a tap.
#[derive(Debug, Clone, Deserialize)]
pub struct TapPair {
    pub p: String,
    pub c: String,
}

/// Body of an admin reset request: the admin's tap and the target's tap.
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub admin: TapPair,
    pub target: TapPair,
}

/// Per-step outcome of a reset claim after the point of no return.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetClaimOutcome {
    pub funds_transfer_ok: bool,
    pub identity_event_ok: bool,
    pub identity_provider_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Validate a delegation submitted by `holder` and build its record.
///
/// The token must authorize the module's key to sign on the holder's
/// behalf: it signs `nostr:delegation:<module>:<conditions>` under the
/// holder key, so the transfer events the module later emits verify
/// downstream.
fn validate_delegation(
    state: &AppState,
    holder: &PublicKey,
    delegation: &DelegationContent,
) -> Result<Delegation, LifecycleError> {
    nip26::verify_token(
        holder,
        &state.config.nostr_public_key,
        &delegation.conditions,
        &delegation.token,
    )?;
    Ok(Delegation::from_conditions(
        *holder,
        &delegation.conditions,
        &delegation.token,
    )?)
}

fn response_tags(topic: &str, recipient: &PublicKey, request: &Event) -> Vec<Vec<String>> {
    vec![
        vec!["t".to_string(), topic.to_string()],
        vec!["p".to_string(), recipient.to_hex()],
        vec!["e".to_string(), request.id.clone()],
    ]
}

/// Initialize: record a freshly programmed NTAG and hand its keys back to
/// the card writer. Re-initializing the same cid returns the existing
/// record so re-programming a card is safe.
#[instrument(skip_all, err)]
pub async fn initialize(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<Event, LifecycleError> {
    let event = preflight(event, now, Some(&state.config.card_writer_pubkey))?;
    let content: InitializeContent = serde_json::from_str(&event.content)?;
    let design = state
        .store
        .design_by_ref(&content.design)
        .await?
        .ok_or(StoreError::DesignNotFound)?;
    let ntag = Ntag {
        cid: content.cid,
        k0: AesKey::random(),
        k1: state.config.server_aes_key,
        k2: AesKey::random(),
        k3: AesKey::random(),
        k4: AesKey::random(),
        ctr: content.ctr,
        otc: None,
        design_uuid: design.uuid,
    };
    let ntag = match state.store.create_ntag(ntag).await {
        Ok(created) => created,
        Err(StoreError::DuplicateCid(cid)) => state
            .store
            .ntag_by_cid(&cid)
            .await?
            .ok_or(StoreError::NotFound)?,
        Err(other) => return Err(other.into()),
    };
    Ok(state.sign(
        kinds::EPHEMERAL_RESPONSE,
        response_tags("card-init-response", &event.pubkey, &event),
        serde_json::to_string(&ntag)?,
        now,
    ))
}

/// Associate: bind a one-time association code to a tapped card.
#[instrument(skip_all, err)]
pub async fn associate(
    state: &AppState,
    p: &str,
    c: &str,
    event: &Event,
    now: UnixTimestamp,
) -> Result<(), LifecycleError> {
    let event = preflight(event, now, Some(&state.config.card_writer_pubkey))?;
    let content: AssociateContent = serde_json::from_str(&event.content)?;
    let tap = sun::verify(state.store.as_ref(), &state.config.server_aes_key, p, c).await?;
    state.store.set_otc(&tap.ntag.cid, &content.otc).await?;
    Ok(())
}

/// Activate: a holder claims an associated NTAG with their association
/// code and a delegation, creating the card with its design defaults.
///
/// A replay of the same signed request (same otc, same holder) inside the
/// event age window returns the already-created card.
#[instrument(skip_all, err)]
pub async fn activate(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<(Event, Card), LifecycleError> {
    let event = preflight(event, now, None)?;
    let holder = event.pubkey;
    let content: ActivateContent = serde_json::from_str(&event.content)?;
    let delegation = validate_delegation(state, &holder, &content.delegation)?;

    let ntag = match state.store.available_ntag_by_otc(&content.otc).await? {
        Some(ntag) => ntag,
        None => {
            // Replayed activation: the otc may already be bound to this
            // very holder's card.
            let existing = match state.store.ntag_by_otc(&content.otc).await? {
                Some(ntag) => state.store.card_by_cid(&ntag.cid).await?,
                None => None,
            };
            return match existing {
                Some(card) if card.holder_pub_key == Some(holder) => {
                    let response = state.sign(
                        kinds::EPHEMERAL_RESPONSE,
                        response_tags(topics::CARD_ACTIVATION_RESPONSE, &holder, &event),
                        serde_json::to_string(&card)?,
                        now,
                    );
                    Ok((response, card))
                }
                _ => Err(LifecycleError::NoAvailableNtag),
            };
        }
    };
    let design = state
        .store
        .design(&ntag.design_uuid)
        .await?
        .ok_or(StoreError::DesignNotFound)?;

    state
        .store
        .upsert_holder(
            holder,
            delegation,
            &state.config.default_trusted_merchants,
        )
        .await?;
    let card = state
        .store
        .create_card(NewCard {
            ntag_cid: ntag.cid,
            holder,
            name: design.name.clone(),
            description: design.description.clone(),
            limits: state.config.default_limits.clone(),
        })
        .await?;

    config_channel::publish_card_data(state, &holder, now).await?;
    config_channel::publish_card_config(state, &holder, None, now).await?;

    let response = state.sign(
        kinds::EPHEMERAL_RESPONSE,
        response_tags(topics::CARD_ACTIVATION_RESPONSE, &holder, &event),
        serde_json::to_string(&card)?,
        now,
    );
    Ok((response, card))
}

/// Card transfer: the new holder submits their delegation together with
/// the donor's donation event; the module decrypts the donated card uuid
/// and rebinds it.
#[instrument(skip_all, err)]
pub async fn transfer(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<(Event, Card), LifecycleError> {
    let event = preflight(event, now, None)?;
    let new_holder = event.pubkey;
    let content: TransferAcceptanceContent = serde_json::from_str(&event.content)?;
    let delegation = validate_delegation(state, &new_holder, &content.delegation)?;

    let donation = &content.donation_event;
    donation
        .verify_signature()
        .map_err(|e| LifecycleError::BadDonation(e.to_string()))?;
    if donation.topic() != Some(topics::CARD_TRANSFER_DONATION) {
        return Err(LifecycleError::BadDonation(
            "donation topic mismatch".to_string(),
        ));
    }
    let donor = *event
        .p_tags()
        .get(1)
        .ok_or_else(|| LifecycleError::BadDonation("missing donor p tag".to_string()))?;
    if donation.pubkey != donor {
        return Err(LifecycleError::BadDonation(
            "donor does not match donation author".to_string(),
        ));
    }

    let card_uuid: Uuid = nip04::decrypt(
        &state.config.nostr_secret_key,
        &donor,
        &donation.content,
    )?
    .trim()
    .trim_matches('"')
    .parse()
    .map_err(|_| LifecycleError::BadDonation("donated content is not a card uuid".to_string()))?;

    state
        .store
        .upsert_holder(
            new_holder,
            delegation,
            &state.config.default_trusted_merchants,
        )
        .await?;
    let card = state
        .store
        .transfer_card(&card_uuid, &donor, &new_holder)
        .await?;

    config_channel::publish_card_data(state, &new_holder, now).await?;
    config_channel::publish_card_config(state, &new_holder, None, now).await?;

    let response = state.sign(
        kinds::EPHEMERAL_RESPONSE,
        response_tags(topics::CARD_TRANSFER_RESPONSE, &new_holder, &event),
        serde_json::to_string(&card)?,
        now,
    );
    Ok((response, card))
}

/// Admin reset, phase 1: an admin taps their own card and the target card
/// in one request; the module mints a short-lived reset nonce bound to the
/// target's holder.
#[instrument(skip_all, err)]
pub async fn admin_reset_request(
    state: &AppState,
    request: &ResetRequest,
    now: UnixTimestamp,
) -> Result<String, LifecycleError> {
    let key = &state.config.server_aes_key;
    let admin_tap = sun::verify(state.store.as_ref(), key, &request.admin.p, &request.admin.c).await?;
    let target_tap =
        sun::verify(state.store.as_ref(), key, &request.target.p, &request.target.c).await?;
    if admin_tap.ntag.cid == target_tap.ntag.cid {
        return Err(LifecycleError::SameCard);
    }

    let admin_card = state
        .store
        .card_by_cid(&admin_tap.ntag.cid)
        .await?
        .ok_or(LifecycleError::NotActivated)?;
    let admin_holder = admin_card
        .holder_pub_key
        .ok_or(LifecycleError::NotActivated)?;
    if !state.config.admin_pubkeys.contains(&admin_holder) {
        return Err(LifecycleError::AdminRequired);
    }

    let target_card = state
        .store
        .card_by_cid(&target_tap.ntag.cid)
        .await?
        .ok_or(LifecycleError::NotActivated)?;
    let target_holder = target_card
        .holder_pub_key
        .ok_or(LifecycleError::NotActivated)?;
    if state.config.admin_pubkeys.contains(&target_holder) {
        return Err(LifecycleError::TargetIsAdmin);
    }
    if target_holder == admin_holder {
        return Err(LifecycleError::SameCard);
    }

    let token = suuid::uuid_to_suuid(&Uuid::new_v4());
    state
        .store
        .upsert_reset_token(ResetToken {
            holder_pub_key: target_holder,
            token: token.clone(),
            created_at: now,
        })
        .await?;
    Ok(token)
}

/// Admin reset, phase 2: the holder's new key claims the nonce.
///
/// The reset token is deleted before any mutation — the point of no
/// return. Card reassignment is transactional; the three downstream side
/// effects (funds sweep under the old delegation, identity-transfer-ok
/// event, identity provider hand-off) are each best-effort and reported
/// individually.
#[instrument(skip_all, err)]
pub async fn admin_reset_claim(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<ResetClaimOutcome, LifecycleError> {
    let event = preflight(event, now, None)?;
    let new_holder = event.pubkey;
    let content: ResetClaimContent = serde_json::from_str(&event.content)?;
    let delegation = validate_delegation(state, &new_holder, &content.delegation)?;

    // Point of no return: the token is consumed even if the claim fails
    // past this line.
    let reset = state
        .store
        .take_reset_token(&content.otc)
        .await?
        .ok_or(LifecycleError::ResetTokenInvalid)?;
    if reset.created_at.is_older_than(RESET_EXPIRY_SECS, now) {
        return Err(LifecycleError::ResetTokenInvalid);
    }
    let old_holder = reset.holder_pub_key;

    let inherited_merchants = state
        .store
        .holder(&old_holder)
        .await?
        .map(|h| h.trusted_merchants)
        .unwrap_or_default();
    state
        .store
        .upsert_holder(new_holder, delegation, &inherited_merchants)
        .await?;
    let moved = state.store.reassign_cards(&old_holder, &new_holder).await?;
    tracing::info!(%old_holder, %new_holder, moved, "cards reassigned by admin reset");

    let funds_transfer_ok = sweep_funds(state, &old_holder, &new_holder, now).await;
    let identity_event_ok = publish_identity_transfer(state, &old_holder, &new_holder, now).await;
    let (identity_provider_ok, name) =
        match state.identity.transfer(&old_holder, &new_holder).await {
            Ok(name) => (true, name),
            Err(error) => {
                tracing::warn!(%error, "identity provider hand-off failed");
                (false, None)
            }
        };

    Ok(ResetClaimOutcome {
        funds_transfer_ok,
        identity_event_ok,
        identity_provider_ok,
        name,
    })
}

/// Publish a transfer of the old holder's remaining balance under their
/// delegation. Returns whether the event went out.
async fn sweep_funds(
    state: &AppState,
    old_holder: &PublicKey,
    new_holder: &PublicKey,
    now: UnixTimestamp,
) -> bool {
    let delegation = match state.store.current_delegation(old_holder, now).await {
        Ok(Some(delegation)) => delegation,
        Ok(None) => {
            tracing::warn!(%old_holder, "no current delegation; funds stay with the old key");
            return false;
        }
        Err(error) => {
            tracing::warn!(%error, "delegation lookup failed");
            return false;
        }
    };
    let tokens = vec!["BTC".to_string()];
    let balances = match state.ledger.balances(old_holder, &tokens).await {
        Ok(balances) => balances,
        Err(error) => {
            tracing::warn!(%error, "balance lookup failed");
            return false;
        }
    };
    let event = state.sign(
        kinds::TRANSACTION,
        vec![
            vec!["p".to_string(), state.config.ledger_pubkey.to_hex()],
            vec!["p".to_string(), new_holder.to_hex()],
            vec![
                "t".to_string(),
                topics::INTERNAL_TRANSACTION_START.to_string(),
            ],
            vec![
                "delegation".to_string(),
                delegation.delegator_pub_key.to_hex(),
                delegation.conditions.clone(),
                delegation.delegation_token.clone(),
            ],
        ],
        serde_json::json!({ "tokens": balances }).to_string(),
        now,
    );
    match state.outbox.publish(event).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "funds transfer emission failed");
            false
        }
    }
}

async fn publish_identity_transfer(
    state: &AppState,
    old_holder: &PublicKey,
    new_holder: &PublicKey,
    now: UnixTimestamp,
) -> bool {
    let event = state.sign(
        kinds::TRANSACTION,
        vec![
            vec!["t".to_string(), topics::IDENTITY_TRANSFER_OK.to_string()],
            vec!["p".to_string(), new_holder.to_hex()],
        ],
        serde_json::json!({ "from": old_holder, "to": new_holder }).to_string(),
        now,
    );
    match state.outbox.publish(event).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "identity-transfer-ok emission failed");
            false
        }
    }
}

/// Admin delete of an NTAG that never became (or no longer is) a card.
#[instrument(skip_all, err)]
pub async fn delete(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<(), LifecycleError> {
    let event = preflight(event, now, Some(&state.config.card_writer_pubkey))?;
    let content: DeleteContent = serde_json::from_str(&event.content)?;
    state.store.delete_ntag(&content.cid).await?;
    Ok(())
}
