//! Ledger balance queries.
//!
//! The authoritative balance of a holder lives in the ledger's event
//! stream; this module only asks the LaWallet API for the materialized
//! number before authorizing a withdrawal.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::types::{PublicKey, TokenAmounts};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Request(String),
    #[error("ledger response malformed: {0}")]
    Malformed(String),
}

/// Balance lookup for a holder, restricted to the named tokens.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balances(
        &self,
        holder: &PublicKey,
        tokens: &[String],
    ) -> Result<TokenAmounts, LedgerError>;
}

/// HTTP client against the LaWallet API.
pub struct HttpLedger {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct BalanceResponse {
    tokens: TokenAmounts,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        Ok(HttpLedger {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn balances(
        &self,
        holder: &PublicKey,
        tokens: &[String],
    ) -> Result<TokenAmounts, LedgerError> {
        let url = format!("{}/api/balance/{}", self.base_url, holder);
        let response = self
            .client
            .get(&url)
            .query(&[("tokens", tokens.join(":"))])
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))?;
        Ok(body
            .tokens
            .into_iter()
            .filter(|(token, _)| tokens.contains(token))
            .collect())
    }
}

/// Fixed balances, for tests and offline runs.
#[derive(Default)]
pub struct StaticLedger {
    balances: TokenAmounts,
}

impl StaticLedger {
    pub fn new(balances: TokenAmounts) -> Self {
        StaticLedger { balances }
    }
}

#[async_trait]
impl Ledger for StaticLedger {
    async fn balances(
        &self,
        _holder: &PublicKey,
        tokens: &[String],
    ) -> Result<TokenAmounts, LedgerError> {
        Ok(self
            .balances
            .iter()
            .filter(|(token, _)| tokens.contains(token))
            .map(|(token, amount)| (token.clone(), *amount))
            .collect())
    }
}
