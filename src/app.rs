//! Process-wide context handed to every handler and service.

use std::sync::Arc;

use crate::config::Config;
use crate::identity::IdentityProvider;
use crate::ledger::Ledger;
use crate::nostr::{Event, EventTemplate};
use crate::outbox::Outbox;
use crate::store::model::Design;
use crate::store::{Store, StoreError};
use crate::timestamp::UnixTimestamp;
use uuid::Uuid;

/// Immutable configuration plus the service seams. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub outbox: Arc<dyn Outbox>,
    pub ledger: Arc<dyn Ledger>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    /// Sign an event as the module.
    pub fn sign(
        &self,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
        now: UnixTimestamp,
    ) -> Event {
        Event::finalize(
            EventTemplate {
                created_at: now,
                kind,
                tags,
                content,
            },
            &self.config.nostr_secret_key,
        )
    }

    /// Seed configured designs and default merchants into the registry.
    /// Idempotent; runs once at startup.
    pub async fn seed(&self) -> Result<(), StoreError> {
        for (name, description) in &self.config.designs {
            if self
                .store
                .design_by_ref(&crate::store::model::DesignRef::ByName {
                    name: name.clone(),
                })
                .await?
                .is_none()
            {
                self.store
                    .insert_design(Design {
                        uuid: Uuid::new_v4(),
                        name: name.clone(),
                        description: description.clone(),
                    })
                    .await?;
            }
        }
        for merchant in &self.config.default_trusted_merchants {
            self.store.register_merchant(*merchant).await?;
        }
        Ok(())
    }
}
