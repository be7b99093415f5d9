//! The event-bus seam.
//!
//! Relay connectivity is not this module's concern: outbound events go
//! through the [`Outbox`] trait and inbound deliveries arrive through an
//! [`EventSource`] subscription. A transport adapter (relay pool, message
//! queue) implements both; [`LoopbackBus`] is the in-process implementation
//! used by tests and as the default wiring seam.

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::nostr::Event;
use crate::timestamp::UnixTimestamp;
use crate::types::PublicKey;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Accepts signed events for at-least-once delivery to the bus.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), OutboxError>;
}

/// Subscription filter in bus terms: kinds, `p` tags, `t` topics, and a
/// lower bound on `created_at`.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u32>,
    pub p_tags: Vec<PublicKey>,
    pub topics: Vec<String>,
    pub since: UnixTimestamp,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if event.created_at < self.since {
            return false;
        }
        if !self.p_tags.is_empty() {
            let ps = event.p_tags();
            if !self.p_tags.iter().any(|p| ps.contains(p)) {
                return false;
            }
        }
        if !self.topics.is_empty() {
            let matched = event
                .topic()
                .map(|t| self.topics.iter().any(|wanted| wanted == t))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Delivers inbound events matching a filter, at least once.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<Event>, OutboxError>;
}

/// In-process bus: every published event is retained (for inspection) and
/// forwarded to matching live subscriptions.
#[derive(Default)]
pub struct LoopbackBus {
    published: Mutex<Vec<Event>>,
    subscribers: Mutex<Vec<(SubscriptionFilter, mpsc::Sender<Event>)>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub async fn published(&self) -> Vec<Event> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Outbox for LoopbackBus {
    async fn publish(&self, event: Event) -> Result<(), OutboxError> {
        self.published.lock().await.push(event.clone());
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|(filter, tx)| {
            if !filter.matches(&event) {
                return !tx.is_closed();
            }
            tx.try_send(event.clone()).is_ok()
        });
        Ok(())
    }
}

#[async_trait]
impl EventSource for LoopbackBus {
    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<mpsc::Receiver<Event>, OutboxError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().await.push((filter, tx));
        Ok(rx)
    }
}
