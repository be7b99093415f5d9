//! Single-use payment-request ledger.
//!
//! Every scan mints a payment request whose uuid, rendered as a 22-char
//! short UUID, becomes the LNURL `k1`. The request stores the scan reply it
//! was issued for (without the `k1` itself) so pay-time checks run against
//! the exact numbers the wallet saw. A request is consumed by the first
//! store transaction that inserts a payment referencing it.

use tracing::instrument;
use uuid::Uuid;

use crate::store::model::PaymentRequest;
use crate::store::{Store, StoreError};
use crate::suuid::{self, SuuidError};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("malformed k1: {0}")]
    MalformedK1(#[from] SuuidError),
    #[error("payment request not found")]
    NotFound,
    #[error("payment request expired")]
    Expired,
    #[error("payment request already used")]
    AlreadyUsed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mint a payment request for `card_uuid` and return its `k1`.
#[instrument(skip_all, err)]
pub async fn issue(
    store: &dyn Store,
    card_uuid: Uuid,
    response_without_k1: serde_json::Value,
    now: UnixTimestamp,
) -> Result<String, StoreError> {
    let request = PaymentRequest {
        uuid: Uuid::new_v4(),
        card_uuid,
        response: response_without_k1,
        created_at: now,
    };
    let k1 = suuid::uuid_to_suuid(&request.uuid);
    store.insert_payment_request(request).await?;
    Ok(k1)
}

/// Resolve a `k1` back to its live payment request.
///
/// This performs the liveness checks only; the caller marks the request
/// consumed by inserting the payment rows through
/// [`Store::consume_payment_request`] in the same logical commit, which
/// re-asserts single use.
#[instrument(skip_all, err)]
pub async fn consume(
    store: &dyn Store,
    k1: &str,
    expiry_secs: u64,
    now: UnixTimestamp,
) -> Result<PaymentRequest, ConsumeError> {
    let uuid = suuid::suuid_to_uuid(k1)?;
    let request = store
        .payment_request(&uuid)
        .await?
        .ok_or(ConsumeError::NotFound)?;
    if request.created_at.is_older_than(expiry_secs, now) {
        return Err(ConsumeError::Expired);
    }
    if store.is_payment_request_consumed(&uuid).await? {
        return Err(ConsumeError::AlreadyUsed);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::model::{Payment, PaymentStatus};

    #[tokio::test]
    async fn test_issue_then_consume() {
        let store = MemoryStore::new();
        let card_uuid = Uuid::new_v4();
        let response = serde_json::json!({"tag": "withdrawRequest", "maxWithdrawable": 1000});
        let k1 = issue(&store, card_uuid, response.clone(), UnixTimestamp(100))
            .await
            .unwrap();
        assert_eq!(k1.len(), 22);
        let request = consume(&store, &k1, 60, UnixTimestamp(120)).await.unwrap();
        assert_eq!(request.card_uuid, card_uuid);
        assert_eq!(request.response, response);
    }

    #[tokio::test]
    async fn test_consume_expired() {
        let store = MemoryStore::new();
        let k1 = issue(&store, Uuid::new_v4(), serde_json::json!({}), UnixTimestamp(100))
            .await
            .unwrap();
        assert!(matches!(
            consume(&store, &k1, 60, UnixTimestamp(161)).await,
            Err(ConsumeError::Expired)
        ));
        // Exactly at the boundary is still live.
        consume(&store, &k1, 60, UnixTimestamp(160)).await.unwrap();
    }

    #[tokio::test]
    async fn test_consume_unknown_and_malformed() {
        let store = MemoryStore::new();
        assert!(matches!(
            consume(&store, &suuid::uuid_to_suuid(&Uuid::new_v4()), 60, UnixTimestamp(0)).await,
            Err(ConsumeError::NotFound)
        ));
        assert!(matches!(
            consume(&store, "not-a-suuid", 60, UnixTimestamp(0)).await,
            Err(ConsumeError::MalformedK1(_))
        ));
    }

    #[tokio::test]
    async fn test_second_consume_after_payment_fails() {
        let store = MemoryStore::new();
        let card_uuid = Uuid::new_v4();
        let k1 = issue(&store, card_uuid, serde_json::json!({}), UnixTimestamp(100))
            .await
            .unwrap();
        let request = consume(&store, &k1, 60, UnixTimestamp(110)).await.unwrap();
        store
            .consume_payment_request(
                &request.uuid,
                vec![Payment {
                    uuid: Uuid::new_v4(),
                    card_uuid,
                    token: "BTC".to_string(),
                    amount: 1000,
                    status: PaymentStatus::Confirmed,
                    payment_request_uuid: request.uuid,
                    created_at: UnixTimestamp(110),
                }],
            )
            .await
            .unwrap();
        assert!(matches!(
            consume(&store, &k1, 60, UnixTimestamp(120)).await,
            Err(ConsumeError::AlreadyUsed)
        ));
    }
}
