//! Inbound subscription loop.
//!
//! Consumes holder-published events addressed to the module (kind 1112,
//! `p`-tagged to the module key) and dispatches them by topic. Progress is
//! tracked as a persisted high-watermark on `created_at`; on restart the
//! subscription resumes from the watermark minus a tolerance window that
//! absorbs clock skew and out-of-order delivery, so handlers must be
//! idempotent.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::app::AppState;
use crate::config_channel;
use crate::nostr::Event;
use crate::nostr::event::{kinds, topics};
use crate::nostr::preflight::preflight;
use crate::outbox::{EventSource, SubscriptionFilter};
use crate::timestamp::UnixTimestamp;

/// Watermark key for the config-change subscription.
pub const CONFIG_SUBSCRIPTION: &str = "card-config-change";

/// Re-read window when resuming: twice the maximum event age.
pub const SINCE_TOLERANCE_SECS: u64 = 360;

const RESUBSCRIBE_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// Run the subscription loop until cancelled. Re-subscribes with backoff
/// whenever the source drops the stream.
pub async fn run(state: AppState, source: Arc<dyn EventSource>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let since = match resume_since(&state).await {
            Ok(since) => since,
            Err(error) => {
                tracing::error!(%error, "cannot compute resume point");
                UnixTimestamp(0)
            }
        };
        let filter = SubscriptionFilter {
            kinds: vec![kinds::TRANSACTION],
            p_tags: vec![state.config.nostr_public_key],
            topics: vec![topics::CARD_CONFIG_CHANGE.to_string()],
            since,
        };
        let mut rx = match source.subscribe(filter).await {
            Ok(rx) => rx,
            Err(error) => {
                tracing::warn!(%error, "subscription failed; backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                }
            }
        };
        tracing::info!(since = %since, "subscribed to config-change events");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                delivery = rx.recv() => match delivery {
                    Some(event) => handle_event(&state, event).await,
                    None => {
                        tracing::warn!("subscription stream closed; resubscribing");
                        break;
                    }
                },
            }
        }
    }
}

async fn resume_since(state: &AppState) -> Result<UnixTimestamp, crate::store::StoreError> {
    let watermark = state
        .store
        .high_watermark(CONFIG_SUBSCRIPTION)
        .await?
        .unwrap_or_default();
    Ok(watermark.saturating_sub(SINCE_TOLERANCE_SECS))
}

/// Validate one delivery, dispatch it by topic, and advance the watermark.
///
/// Failures are logged, never fatal to the loop; the watermark advances
/// regardless so a poison event cannot wedge the subscription.
#[instrument(skip_all, fields(event = %event.id, topic = event.topic().unwrap_or("")))]
pub(crate) async fn handle_event(state: &AppState, event: Event) {
    let now = match UnixTimestamp::try_now() {
        Ok(now) => now,
        Err(error) => {
            tracing::error!(%error, "system clock unavailable");
            return;
        }
    };
    match preflight(&event, now, None) {
        Ok(resolved) => match resolved.topic() {
            Some(topics::CARD_CONFIG_CHANGE) => {
                if let Err(error) =
                    config_channel::apply_config_change(state, &resolved, now).await
                {
                    tracing::warn!(%error, "config change rejected");
                }
            }
            other => {
                tracing::debug!(topic = ?other, "no handler for topic");
            }
        },
        Err(error) => {
            tracing::warn!(%error, "inbound event failed preflight");
        }
    }
    if let Err(error) = state
        .store
        .set_high_watermark(CONFIG_SUBSCRIPTION, event.created_at)
        .await
    {
        tracing::error!(%error, "failed to persist high-watermark");
    }
}
