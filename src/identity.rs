//! External identity-provider client.
//!
//! Holders may have a human-readable name registered with an identity
//! provider. The module consults it for diagnostics and notifies it when an
//! admin reset moves an identity to a new key. Calls are bounded and their
//! failure is non-fatal wherever the lifecycle says so.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::types::PublicKey;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider request failed: {0}")]
    Request(String),
    #[error("identity provider response malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The registered name for a key, if any.
    async fn resolve_name(&self, pubkey: &PublicKey) -> Result<Option<String>, IdentityError>;

    /// Move the identity registered under `from` to `to`. Returns the
    /// registered name when the provider reports one.
    async fn transfer(
        &self,
        from: &PublicKey,
        to: &PublicKey,
    ) -> Result<Option<String>, IdentityError>;
}

pub struct HttpIdentityProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct NameResponse {
    name: Option<String>,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IdentityError::Request(e.to_string()))?;
        Ok(HttpIdentityProvider {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn resolve_name(&self, pubkey: &PublicKey) -> Result<Option<String>, IdentityError> {
        let url = format!("{}/api/identity/{}", self.base_url, pubkey);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| IdentityError::Request(e.to_string()))?;
        let body: NameResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        Ok(body.name)
    }

    async fn transfer(
        &self,
        from: &PublicKey,
        to: &PublicKey,
    ) -> Result<Option<String>, IdentityError> {
        let url = format!("{}/api/identity/transfer", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "from": from, "to": to }))
            .send()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| IdentityError::Request(e.to_string()))?;
        let body: NameResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        Ok(body.name)
    }
}

/// Fixed identities, for tests and offline runs.
#[derive(Default)]
pub struct StaticIdentityProvider {
    names: std::collections::HashMap<PublicKey, String>,
    pub fail_transfers: bool,
}

impl StaticIdentityProvider {
    pub fn new(names: std::collections::HashMap<PublicKey, String>) -> Self {
        StaticIdentityProvider {
            names,
            fail_transfers: false,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve_name(&self, pubkey: &PublicKey) -> Result<Option<String>, IdentityError> {
        Ok(self.names.get(pubkey).cloned())
    }

    async fn transfer(
        &self,
        from: &PublicKey,
        _to: &PublicKey,
    ) -> Result<Option<String>, IdentityError> {
        if self.fail_transfers {
            return Err(IdentityError::Request("provider offline".to_string()));
        }
        Ok(self.names.get(from).cloned())
    }
}
