//! Sliding-window spending limits.
//!
//! A card may carry several limits per token (for example an hourly and a
//! daily window); the effective allowance for a token is the minimum over
//! its limits of `amount − spent-within-window`. Exhausted tokens are
//! omitted from the result entirely, so callers can treat presence in the
//! map as "withdrawable".

use std::collections::BTreeMap;
use tracing::instrument;

use crate::store::{Store, StoreError};
use crate::store::model::Card;
use crate::timestamp::UnixTimestamp;
use crate::types::TokenAmounts;

/// Default token set when a scan does not name any.
pub const DEFAULT_TOKENS: &[&str] = &["BTC"];

/// Remaining allowance per token for `card`, evaluated at `now`.
#[instrument(skip_all, err, fields(card = %card.uuid))]
pub async fn remaining(
    store: &dyn Store,
    card: &Card,
    tokens: &[String],
    now: UnixTimestamp,
) -> Result<TokenAmounts, StoreError> {
    let limits = store.limits_for_card(&card.uuid).await?;
    let mut minima: BTreeMap<String, i128> = BTreeMap::new();
    for limit in limits {
        if !tokens.contains(&limit.token) {
            continue;
        }
        let window_start = now.saturating_sub(limit.delta);
        let spent = store
            .payments_total_since(&card.uuid, &limit.token, window_start)
            .await?;
        let available = limit.amount as i128 - spent as i128;
        minima
            .entry(limit.token.clone())
            .and_modify(|m| *m = (*m).min(available))
            .or_insert(available);
    }
    Ok(minima
        .into_iter()
        .filter(|(_, available)| *available > 0)
        .map(|(token, available)| (token, available as u64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::model::{
        Delegation, Design, NewCard, NewLimit, Payment, PaymentRequest, PaymentStatus,
    };
    use crate::types::PublicKey;
    use uuid::Uuid;

    fn limit(token: &str, amount: u64, delta: u64) -> NewLimit {
        NewLimit {
            name: format!("{token}-{delta}s"),
            description: String::new(),
            token: token.to_string(),
            amount,
            delta,
        }
    }

    async fn card_with_limits(store: &MemoryStore, limits: Vec<NewLimit>) -> Card {
        let design = Design {
            uuid: Uuid::new_v4(),
            name: "d".to_string(),
            description: String::new(),
        };
        store.insert_design(design.clone()).await.unwrap();
        let ntag = crate::store::model::Ntag {
            cid: "f0da0000000010".parse().unwrap(),
            k0: crate::types::AesKey::random(),
            k1: crate::types::AesKey::random(),
            k2: crate::types::AesKey::random(),
            k3: crate::types::AesKey::random(),
            k4: crate::types::AesKey::random(),
            ctr: 0,
            otc: None,
            design_uuid: design.uuid,
        };
        store.create_ntag(ntag).await.unwrap();
        let holder = PublicKey([1u8; 32]);
        store
            .upsert_holder(
                holder,
                Delegation {
                    delegator_pub_key: holder,
                    conditions: "kind=1112&created_at>1&created_at<9999999999".to_string(),
                    delegation_token: "00".repeat(64),
                    since: UnixTimestamp(1),
                    until: UnixTimestamp(9999999999),
                },
                &[],
            )
            .await
            .unwrap();
        store
            .create_card(NewCard {
                ntag_cid: "f0da0000000010".parse().unwrap(),
                holder,
                name: "c".to_string(),
                description: String::new(),
                limits,
            })
            .await
            .unwrap()
    }

    async fn pay(store: &MemoryStore, card: &Card, token: &str, amount: u64, at: u64) {
        let request = PaymentRequest {
            uuid: Uuid::new_v4(),
            card_uuid: card.uuid,
            response: serde_json::json!({}),
            created_at: UnixTimestamp(at),
        };
        store.insert_payment_request(request.clone()).await.unwrap();
        store
            .consume_payment_request(
                &request.uuid,
                vec![Payment {
                    uuid: Uuid::new_v4(),
                    card_uuid: card.uuid,
                    token: token.to_string(),
                    amount,
                    status: PaymentStatus::Confirmed,
                    payment_request_uuid: request.uuid,
                    created_at: UnixTimestamp(at),
                }],
            )
            .await
            .unwrap();
    }

    fn btc() -> Vec<String> {
        vec!["BTC".to_string()]
    }

    #[tokio::test]
    async fn test_fresh_card_has_full_allowance() {
        let store = MemoryStore::new();
        let card = card_with_limits(&store, vec![limit("BTC", 1_000_000, 60)]).await;
        let rem = remaining(&store, &card, &btc(), UnixTimestamp(1000))
            .await
            .unwrap();
        assert_eq!(rem.get("BTC"), Some(&1_000_000));
    }

    #[tokio::test]
    async fn test_payments_in_window_reduce_allowance() {
        let store = MemoryStore::new();
        let card = card_with_limits(&store, vec![limit("BTC", 1_000_000, 60)]).await;
        pay(&store, &card, "BTC", 999_000, 990).await;
        let rem = remaining(&store, &card, &btc(), UnixTimestamp(1000))
            .await
            .unwrap();
        assert_eq!(rem.get("BTC"), Some(&1000));
    }

    #[tokio::test]
    async fn test_payments_outside_window_ignored() {
        let store = MemoryStore::new();
        let card = card_with_limits(&store, vec![limit("BTC", 1_000_000, 60)]).await;
        pay(&store, &card, "BTC", 999_000, 900).await;
        let rem = remaining(&store, &card, &btc(), UnixTimestamp(1000))
            .await
            .unwrap();
        assert_eq!(rem.get("BTC"), Some(&1_000_000));
    }

    #[tokio::test]
    async fn test_exhausted_token_omitted() {
        let store = MemoryStore::new();
        let card = card_with_limits(&store, vec![limit("BTC", 1000, 60)]).await;
        pay(&store, &card, "BTC", 1000, 995).await;
        let rem = remaining(&store, &card, &btc(), UnixTimestamp(1000))
            .await
            .unwrap();
        assert!(rem.is_empty());
    }

    #[tokio::test]
    async fn test_minimum_across_windows() {
        let store = MemoryStore::new();
        let card = card_with_limits(
            &store,
            vec![limit("BTC", 1_000_000, 3600), limit("BTC", 10_000, 60)],
        )
        .await;
        pay(&store, &card, "BTC", 4_000, 990).await;
        let rem = remaining(&store, &card, &btc(), UnixTimestamp(1000))
            .await
            .unwrap();
        // The tight window dominates.
        assert_eq!(rem.get("BTC"), Some(&6_000));
    }

    #[tokio::test]
    async fn test_multi_token_and_unlimited_token_absent() {
        let store = MemoryStore::new();
        let card = card_with_limits(
            &store,
            vec![limit("BTC", 1_000_000, 60), limit("USD", 500, 60)],
        )
        .await;
        let tokens = vec!["BTC".to_string(), "USD".to_string(), "XAU".to_string()];
        let rem = remaining(&store, &card, &tokens, UnixTimestamp(1000))
            .await
            .unwrap();
        assert_eq!(rem.get("BTC"), Some(&1_000_000));
        assert_eq!(rem.get("USD"), Some(&500));
        // No limit for XAU means no allowance entry at all.
        assert!(!rem.contains_key("XAU"));
    }
}
