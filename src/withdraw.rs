//! Scan → pay flows: LUD-03 LNURL-withdraw and the extended multi-token
//! variant.
//!
//! A scan verifies the tap, checks the card's status, computes the live
//! allowance, and mints a single-use `k1`. The pay callback re-validates
//! everything against the stored scan reply — consume the `k1`, re-check
//! limits and ledger balance, require a current delegation — then records
//! the payment and emits the signed transfer-start event. The payment rows
//! and the `k1` consumption commit together; event emission failing
//! afterwards is logged and the rows stand as durable intent.

use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use tracing::instrument;

use crate::app::AppState;
use crate::ledger::LedgerError;
use crate::limits;
use crate::nostr::Event;
use crate::nostr::event::{kinds, topics};
use crate::nostr::preflight::{PreflightError, preflight};
use crate::payment_request::{self, ConsumeError};
use crate::store::StoreError;
use crate::store::model::{Card, Delegation, NtagState, Payment, PaymentStatus};
use crate::sun::{self, SunError};
use crate::timestamp::UnixTimestamp;
use crate::types::{IdParseError, PublicKey, TokenAmounts};
use uuid::Uuid;

/// Scan behaviors selected by the `X-LaWallet-Action` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Plain LUD-03 withdraw request (BTC only).
    Standard,
    /// Multi-token withdraw request.
    Extended { tokens: Vec<String> },
    /// Return the holder's public key as a signed event.
    IdentityQuery,
    /// Read-only provisioning diagnostics.
    Info,
    /// LNURL-pay descriptor for paying the card's holder.
    PayRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum WithdrawError {
    #[error(transparent)]
    Sun(#[from] SunError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Consume(#[from] ConsumeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error("malformed request content: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Pubkey(#[from] IdParseError),
    #[error("card is not activated")]
    NotActivated,
    #[error("card is disabled")]
    CardDisabled,
    #[error("invalid invoice: {0}")]
    Invoice(String),
    #[error("invoice expired")]
    InvoiceExpired,
    #[error("invalid transaction: wrong request tag")]
    WrongRequestTag,
    #[error("no tokens requested")]
    NoTokens,
    #[error("token {0} was not offered by the scan")]
    TokenNotOffered(String),
    #[error("amount for {0} exceeds the authorized maximum")]
    ExceedsMax(String),
    #[error("amount for {0} exceeds the remaining limit")]
    ExceedsRemaining(String),
    #[error("amount for {0} exceeds the available balance")]
    ExceedsBalance(String),
    #[error("holder has no current delegation")]
    NoDelegation,
}

/// Resolve a tap to its activated, enabled card and holder.
async fn authorized_card(
    state: &AppState,
    p: &str,
    c: &str,
) -> Result<(Card, PublicKey), WithdrawError> {
    let tap = sun::verify(state.store.as_ref(), &state.config.server_aes_key, p, c).await?;
    let card = state
        .store
        .card_by_cid(&tap.ntag.cid)
        .await?
        .ok_or(WithdrawError::NotActivated)?;
    let holder = card.holder_pub_key.ok_or(WithdrawError::NotActivated)?;
    if !card.enabled {
        return Err(WithdrawError::CardDisabled);
    }
    Ok((card, holder))
}

/// Handle `GET /card/scan` for the given action.
#[instrument(skip_all, err)]
pub async fn scan(
    state: &AppState,
    p: &str,
    c: &str,
    action: ScanAction,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    match action {
        ScanAction::Standard => scan_standard(state, p, c, now).await,
        ScanAction::Extended { tokens } => scan_extended(state, p, c, tokens, now).await,
        ScanAction::IdentityQuery => identity_query(state, p, c, now).await,
        ScanAction::Info => Ok(info(state, p, c, now).await),
        ScanAction::PayRequest => pay_request(state, p, c).await,
    }
}

async fn scan_standard(
    state: &AppState,
    p: &str,
    c: &str,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let (card, _holder) = authorized_card(state, p, c).await?;
    let tokens = vec!["BTC".to_string()];
    let remaining = limits::remaining(state.store.as_ref(), &card, &tokens, now).await?;
    let max_withdrawable = remaining.get("BTC").copied().unwrap_or(0);
    let response = json!({
        "tag": "withdrawRequest",
        "callback": format!("{}/card/pay", state.config.api_base_url),
        "defaultDescription": "LaWallet",
        "minWithdrawable": 0,
        "maxWithdrawable": max_withdrawable,
    });
    let k1 = payment_request::issue(state.store.as_ref(), card.uuid, response.clone(), now).await?;
    let mut response = response;
    response["k1"] = json!(k1);
    Ok(response)
}

async fn scan_extended(
    state: &AppState,
    p: &str,
    c: &str,
    tokens: Vec<String>,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let (card, _holder) = authorized_card(state, p, c).await?;
    let tokens = if tokens.is_empty() {
        limits::DEFAULT_TOKENS.iter().map(|t| t.to_string()).collect()
    } else {
        tokens
    };
    let remaining = limits::remaining(state.store.as_ref(), &card, &tokens, now).await?;
    let mut token_entries = serde_json::Map::new();
    for (token, max) in &remaining {
        token_entries.insert(
            token.clone(),
            json!({ "minWithdrawable": 0, "maxWithdrawable": max }),
        );
    }
    let response = json!({
        "tag": "laWallet:withdrawRequest",
        "callback": format!("{}/card/pay", state.config.api_base_url),
        "defaultDescription": "LaWallet",
        "tokens": Value::Object(token_entries),
    });
    let k1 = payment_request::issue(state.store.as_ref(), card.uuid, response.clone(), now).await?;
    let mut response = response;
    response["k1"] = json!(k1);
    Ok(response)
}

async fn identity_query(
    state: &AppState,
    p: &str,
    c: &str,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let (_card, holder) = authorized_card(state, p, c).await?;
    let event = state.sign(
        kinds::EPHEMERAL_RESPONSE,
        vec![vec!["t".to_string(), "identity-query-response".to_string()]],
        holder.to_hex(),
        now,
    );
    Ok(serde_json::to_value(event)?)
}

/// Read-only diagnostics: reports how far along the provisioning pipeline
/// this card is. Unlike every other path this does reveal which layer
/// fails, and it never advances the tap counter.
async fn info(state: &AppState, p: &str, c: &str, now: UnixTimestamp) -> Value {
    let mut report = json!({
        "initialized": false,
        "associated": false,
        "activated": false,
        "hasDelegation": false,
        "hasIdentity": false,
        "ntag424": Value::Null,
        "card": Value::Null,
    });
    let Ok(picc) = sun::decrypt_picc(p, &state.config.server_aes_key) else {
        return report;
    };
    let Ok(Some(ntag)) = state.store.ntag_by_cid(&picc.cid).await else {
        return report;
    };
    report["initialized"] = json!(true);
    let tap_valid = picc.counter > ntag.ctr
        && sun::verify_tag(&ntag.k2, &picc.cid, picc.counter, c).is_ok();
    report["ntag424"] = json!({
        "cid": ntag.cid,
        "ctr": ntag.ctr,
        "tapCtr": picc.counter,
        "tapValid": tap_valid,
        "otc": ntag.otc.clone(),
    });
    let card = state.store.card_by_cid(&picc.cid).await.ok().flatten();
    let state_now = NtagState::derive(&ntag, card.as_ref());
    if state_now == NtagState::Initialized {
        return report;
    }
    report["associated"] = json!(true);
    if state_now != NtagState::Activated {
        return report;
    }
    let card = card.expect("activated implies card");
    let holder = card.holder_pub_key.expect("activated implies holder");
    report["activated"] = json!(true);
    report["card"] = json!({
        "uuid": card.uuid,
        "name": card.name,
        "enabled": card.enabled,
        "holderPubKey": holder,
    });
    if let Ok(Some(_)) = state.store.current_delegation(&holder, now).await {
        report["hasDelegation"] = json!(true);
    }
    if let Ok(Some(name)) = state.identity.resolve_name(&holder).await {
        report["hasIdentity"] = json!(true);
        report["name"] = json!(name);
    }
    report
}

async fn pay_request(state: &AppState, p: &str, c: &str) -> Result<Value, WithdrawError> {
    let (_card, holder) = authorized_card(state, p, c).await?;
    Ok(json!({
        "tag": "payRequest",
        "callback": format!("{}/lnurlp/{}/callback", state.config.api_base_url, holder),
        "minSendable": 1000,
        "maxSendable": 100_000_000_000u64,
        "metadata": "[[\"text/plain\",\"LaWallet\"]]",
    }))
}

/// Decoded bolt11 fields the pay path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub msats: u64,
    pub expired: bool,
}

/// Decode a bolt11 invoice to its millisatoshi amount and expiry state.
pub fn decode_invoice(pr: &str) -> Result<DecodedInvoice, WithdrawError> {
    let invoice = lightning_invoice::Bolt11Invoice::from_str(pr)
        .map_err(|e| WithdrawError::Invoice(e.to_string()))?;
    let msats = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| WithdrawError::Invoice("invoice carries no amount".to_string()))?;
    Ok(DecodedInvoice {
        msats,
        expired: invoice.is_expired(),
    })
}

fn delegation_tag(delegation: &Delegation) -> Vec<String> {
    vec![
        "delegation".to_string(),
        delegation.delegator_pub_key.to_hex(),
        delegation.conditions.clone(),
        delegation.delegation_token.clone(),
    ]
}

/// Common tail of both pay paths: bound checks against the stored scan
/// reply, the live limits, and the ledger; then the consuming commit and
/// the transfer-start emission.
async fn settle(
    state: &AppState,
    request_uuid: Uuid,
    card: &Card,
    holder: &PublicKey,
    amounts: &TokenAmounts,
    max_for: impl Fn(&str) -> Option<u64>,
    second_p: PublicKey,
    bolt11: Option<&str>,
    now: UnixTimestamp,
) -> Result<(), WithdrawError> {
    if amounts.is_empty() {
        return Err(WithdrawError::NoTokens);
    }
    let tokens: Vec<String> = amounts.keys().cloned().collect();
    let remaining = limits::remaining(state.store.as_ref(), card, &tokens, now).await?;
    let balances = state.ledger.balances(holder, &tokens).await?;
    for (token, amount) in amounts {
        let max = max_for(token).ok_or_else(|| WithdrawError::TokenNotOffered(token.clone()))?;
        if *amount > max {
            return Err(WithdrawError::ExceedsMax(token.clone()));
        }
        if *amount > remaining.get(token).copied().unwrap_or(0) {
            return Err(WithdrawError::ExceedsRemaining(token.clone()));
        }
        if *amount > balances.get(token).copied().unwrap_or(0) {
            return Err(WithdrawError::ExceedsBalance(token.clone()));
        }
    }
    let delegation = state
        .store
        .current_delegation(holder, now)
        .await?
        .ok_or(WithdrawError::NoDelegation)?;

    let payments = amounts
        .iter()
        .map(|(token, amount)| Payment {
            uuid: Uuid::new_v4(),
            card_uuid: card.uuid,
            token: token.clone(),
            amount: *amount,
            status: PaymentStatus::Confirmed,
            payment_request_uuid: request_uuid,
            created_at: now,
        })
        .collect();
    state
        .store
        .consume_payment_request(&request_uuid, payments)
        .await
        .map_err(|e| match e {
            StoreError::AlreadyUsed => WithdrawError::Consume(ConsumeError::AlreadyUsed),
            other => WithdrawError::Store(other),
        })?;

    let mut tags = vec![
        vec!["p".to_string(), state.config.ledger_pubkey.to_hex()],
        vec!["p".to_string(), second_p.to_hex()],
        vec![
            "t".to_string(),
            topics::INTERNAL_TRANSACTION_START.to_string(),
        ],
        delegation_tag(&delegation),
    ];
    if let Some(pr) = bolt11 {
        tags.push(vec!["bolt11".to_string(), pr.to_string()]);
    }
    let event = state.sign(
        kinds::TRANSACTION,
        tags,
        json!({ "tokens": amounts }).to_string(),
        now,
    );
    if let Err(error) = state.outbox.publish(event).await {
        // The payment rows are the durable intent; a reconciler may retry
        // the emission.
        tracing::error!(%error, request = %request_uuid, "transfer-start emission failed");
    }
    Ok(())
}

/// `GET /card/pay?k1&pr`: standard LNURL-withdraw callback.
#[instrument(skip_all, err)]
pub async fn pay_lud03(
    state: &AppState,
    k1: &str,
    pr: &str,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let invoice = decode_invoice(pr)?;
    if invoice.expired {
        return Err(WithdrawError::InvoiceExpired);
    }
    settle_lud03(state, k1, invoice.msats, pr, now).await
}

/// The standard pay path after invoice decoding.
pub(crate) async fn settle_lud03(
    state: &AppState,
    k1: &str,
    msats: u64,
    pr: &str,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let request = payment_request::consume(
        state.store.as_ref(),
        k1,
        state.config.payment_request_expiry_secs,
        now,
    )
    .await?;
    if request.response.get("tag").and_then(Value::as_str) != Some("withdrawRequest") {
        return Err(WithdrawError::WrongRequestTag);
    }
    let card = state
        .store
        .card(&request.card_uuid)
        .await?
        .ok_or(WithdrawError::NotActivated)?;
    let holder = card.holder_pub_key.ok_or(WithdrawError::NotActivated)?;
    if !card.enabled {
        return Err(WithdrawError::CardDisabled);
    }
    let max = request
        .response
        .get("maxWithdrawable")
        .and_then(Value::as_u64);
    let amounts = TokenAmounts::from([("BTC".to_string(), msats)]);
    settle(
        state,
        request.uuid,
        &card,
        &holder,
        &amounts,
        |token| if token == "BTC" { max } else { None },
        state.config.btc_gateway_pubkey,
        Some(pr),
        now,
    )
    .await?;
    Ok(json!({ "status": "OK" }))
}

#[derive(Debug, Deserialize)]
struct ExtendedPayContent {
    k1: String,
    pubkey: String,
    tokens: TokenAmounts,
}

/// `POST /card/pay`: extended multi-token withdraw, body is a signed event.
#[instrument(skip_all, err)]
pub async fn pay_extended(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<Value, WithdrawError> {
    let event = preflight(event, now, None)?;
    let content: ExtendedPayContent = serde_json::from_str(&event.content)?;
    let recipient = PublicKey::parse_flexible(&content.pubkey)?;

    let request = payment_request::consume(
        state.store.as_ref(),
        &content.k1,
        state.config.payment_request_expiry_secs,
        now,
    )
    .await?;
    if request.response.get("tag").and_then(Value::as_str) != Some("laWallet:withdrawRequest") {
        return Err(WithdrawError::WrongRequestTag);
    }
    let card = state
        .store
        .card(&request.card_uuid)
        .await?
        .ok_or(WithdrawError::NotActivated)?;
    let holder = card.holder_pub_key.ok_or(WithdrawError::NotActivated)?;
    if !card.enabled {
        return Err(WithdrawError::CardDisabled);
    }
    let offered = request.response.get("tokens").cloned().unwrap_or(Value::Null);
    settle(
        state,
        request.uuid,
        &card,
        &holder,
        &content.tokens,
        |token| {
            offered
                .get(token)?
                .get("maxWithdrawable")
                .and_then(Value::as_u64)
        },
        recipient,
        None,
        now,
    )
    .await?;
    Ok(json!({ "status": "OK" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::EventTemplate;
    use crate::store::model::{CardPatch, ConfigChange, NewLimit};
    use crate::testing::{Harness, TestHolder};
    use secp256k1::SecretKey;
    use std::collections::BTreeMap;

    // BOLT 11 specification example: 2 500 000 000 msat, issued 2017-06-01
    // with a 60-second expiry, so decoding succeeds and it is long expired.
    const SPEC_INVOICE: &str = "lnbc2500u1pvjluezpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqdq5xysxxatsyp3k7enxv4jsxqzpuaztrnwngzn3kdzw5hydlzf03qdgm2hdq27cqv3agm2awhz5se903vruatfhq77w3ls4evs3ch9zw97j25emudupq63nyw24cg27h2rspfj9srp";

    async fn set_limits(harness: &Harness, holder: &TestHolder, limits: Vec<NewLimit>) {
        let mut cards = BTreeMap::new();
        cards.insert(
            holder.card.uuid,
            CardPatch {
                name: None,
                description: None,
                enabled: None,
                limits,
            },
        );
        harness
            .state
            .store
            .apply_config(
                &holder.pubkey,
                ConfigChange {
                    trusted_merchants: vec![],
                    cards,
                },
            )
            .await
            .unwrap();
    }

    fn new_limit(token: &str, amount: u64, delta: u64) -> NewLimit {
        NewLimit {
            name: format!("{token} window"),
            description: String::new(),
            token: token.to_string(),
            amount,
            delta,
        }
    }

    #[tokio::test]
    async fn test_scan_standard_shape() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        assert_eq!(response["tag"], "withdrawRequest");
        assert_eq!(response["defaultDescription"], "LaWallet");
        assert_eq!(response["minWithdrawable"], 0);
        assert_eq!(response["maxWithdrawable"], 1_000_000);
        assert_eq!(
            response["callback"],
            "https://api.lawallet.ar/card/pay"
        );
        assert_eq!(response["k1"].as_str().unwrap().len(), 22);
    }

    #[tokio::test]
    async fn test_scan_rejects_disabled_card() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let mut cards = BTreeMap::new();
        cards.insert(
            holder.card.uuid,
            CardPatch {
                enabled: Some(false),
                ..Default::default()
            },
        );
        harness
            .state
            .store
            .apply_config(
                &holder.pubkey,
                ConfigChange {
                    trusted_merchants: vec![],
                    cards,
                },
            )
            .await
            .unwrap();
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        assert!(matches!(
            scan(&harness.state, &p, &c, ScanAction::Standard, harness.now()).await,
            Err(WithdrawError::CardDisabled)
        ));
    }

    #[tokio::test]
    async fn test_scan_counter_rewind_rejected() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        // Tap at counter 5.
        let (p, c) = harness.tap(&holder.ntag, 5);
        scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        // A replay from counter 3 must fail.
        let (p, c) = harness.tap(&holder.ntag, 3);
        assert!(matches!(
            scan(&harness.state, &p, &c, ScanAction::Standard, harness.now()).await,
            Err(WithdrawError::Sun(SunError::CounterNotAdvanced { .. }))
        ));
    }

    #[tokio::test]
    async fn test_standard_pay_flow_and_replay_defense() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();

        let result = settle_lud03(&harness.state, &k1, 1000, "lnbc10n1stub", harness.now())
            .await
            .unwrap();
        assert_eq!(result["status"], "OK");

        let published = harness.bus.published().await;
        let transfer = published
            .iter()
            .rev()
            .find(|e| e.topic() == Some(topics::INTERNAL_TRANSACTION_START))
            .unwrap();
        assert_eq!(transfer.kind, kinds::TRANSACTION);
        let ps = transfer.p_tags();
        assert_eq!(ps[0], harness.state.config.ledger_pubkey);
        assert_eq!(ps[1], harness.state.config.btc_gateway_pubkey);
        assert_eq!(transfer.tag_value("bolt11"), Some("lnbc10n1stub"));
        let content: Value = serde_json::from_str(&transfer.content).unwrap();
        assert_eq!(content["tokens"]["BTC"], 1000);
        let (delegator, _, _) = transfer.delegation_tag().unwrap();
        assert_eq!(delegator, holder.pubkey);

        // Same k1 a second time: the request is already consumed.
        assert!(matches!(
            settle_lud03(&harness.state, &k1, 1000, "lnbc10n1stub", harness.now()).await,
            Err(WithdrawError::Consume(ConsumeError::AlreadyUsed))
        ));
    }

    #[tokio::test]
    async fn test_limit_enforcement_across_scans() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        set_limits(&harness, &holder, vec![new_limit("BTC", 1_000_000, 60)]).await;

        // Spend 999 000 inside the window.
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();
        settle_lud03(&harness.state, &k1, 999_000, "lnbc1stub", harness.now())
            .await
            .unwrap();

        // The next scan only offers the 1 000 msat that are left.
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        assert_eq!(response["maxWithdrawable"], 1000);
        let k1 = response["k1"].as_str().unwrap().to_string();

        // Trying to pull 2 000 msat fails.
        let err = settle_lud03(&harness.state, &k1, 2000, "lnbc2stub", harness.now())
            .await
            .unwrap_err();
        assert!(matches!(err, WithdrawError::ExceedsMax(_)));
    }

    #[tokio::test]
    async fn test_pay_rejects_insufficient_balance() {
        let harness =
            Harness::with_balances(TokenAmounts::from([("BTC".to_string(), 500)])).await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();
        assert!(matches!(
            settle_lud03(&harness.state, &k1, 1000, "lnbc1stub", harness.now()).await,
            Err(WithdrawError::ExceedsBalance(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_spec_invoice() {
        let decoded = decode_invoice(SPEC_INVOICE).unwrap();
        assert_eq!(decoded.msats, 250_000_000);
        assert!(decoded.expired);
    }

    #[tokio::test]
    async fn test_pay_rejects_expired_invoice() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();
        assert!(matches!(
            pay_lud03(&harness.state, &k1, SPEC_INVOICE, harness.now()).await,
            Err(WithdrawError::InvoiceExpired)
        ));
    }

    #[tokio::test]
    async fn test_extended_scan_and_pay() {
        let harness = Harness::with_balances(TokenAmounts::from([
            ("BTC".to_string(), 100_000_000),
            ("USD".to_string(), 1_000),
        ]))
        .await;
        let holder = harness.activate_default_card().await;
        set_limits(
            &harness,
            &holder,
            vec![new_limit("BTC", 1_000_000, 3600), new_limit("USD", 500, 3600)],
        )
        .await;

        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(
            &harness.state,
            &p,
            &c,
            ScanAction::Extended {
                tokens: vec!["BTC".to_string(), "USD".to_string()],
            },
            harness.now(),
        )
        .await
        .unwrap();
        assert_eq!(response["tag"], "laWallet:withdrawRequest");
        assert_eq!(response["tokens"]["BTC"]["maxWithdrawable"], 1_000_000);
        assert_eq!(response["tokens"]["USD"]["maxWithdrawable"], 500);
        let k1 = response["k1"].as_str().unwrap().to_string();

        let recipient_secret = SecretKey::from_slice(&[0x51; 32]).unwrap();
        let recipient = crate::nostr::event::public_key_for(&recipient_secret);
        let npub = bech32::encode::<bech32::Bech32>(
            bech32::Hrp::parse("npub").unwrap(),
            recipient.as_bytes(),
        )
        .unwrap();
        let event = Event::finalize(
            EventTemplate {
                created_at: harness.now(),
                kind: kinds::TRANSACTION,
                tags: vec![],
                content: serde_json::json!({
                    "k1": k1,
                    "pubkey": npub,
                    "tokens": { "USD": 200 },
                })
                .to_string(),
            },
            &holder.secret,
        );
        let result = pay_extended(&harness.state, &event, harness.now())
            .await
            .unwrap();
        assert_eq!(result["status"], "OK");

        let published = harness.bus.published().await;
        let transfer = published
            .iter()
            .rev()
            .find(|e| e.topic() == Some(topics::INTERNAL_TRANSACTION_START))
            .unwrap();
        let ps = transfer.p_tags();
        assert_eq!(ps[1], recipient);
        assert!(transfer.tag_value("bolt11").is_none());
        let content: Value = serde_json::from_str(&transfer.content).unwrap();
        assert_eq!(content["tokens"]["USD"], 200);
    }

    #[tokio::test]
    async fn test_extended_pay_rejects_unoffered_token() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(
            &harness.state,
            &p,
            &c,
            ScanAction::Extended {
                tokens: vec!["BTC".to_string()],
            },
            harness.now(),
        )
        .await
        .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();
        let event = Event::finalize(
            EventTemplate {
                created_at: harness.now(),
                kind: kinds::TRANSACTION,
                tags: vec![],
                content: serde_json::json!({
                    "k1": k1,
                    "pubkey": holder.pubkey.to_hex(),
                    "tokens": { "XAU": 1 },
                })
                .to_string(),
            },
            &holder.secret,
        );
        assert!(matches!(
            pay_extended(&harness.state, &event, harness.now()).await,
            Err(WithdrawError::TokenNotOffered(_))
        ));
    }

    #[tokio::test]
    async fn test_extended_pay_requires_extended_scan() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::Standard, harness.now())
            .await
            .unwrap();
        let k1 = response["k1"].as_str().unwrap().to_string();
        let event = Event::finalize(
            EventTemplate {
                created_at: harness.now(),
                kind: kinds::TRANSACTION,
                tags: vec![],
                content: serde_json::json!({
                    "k1": k1,
                    "pubkey": holder.pubkey.to_hex(),
                    "tokens": { "BTC": 100 },
                })
                .to_string(),
            },
            &holder.secret,
        );
        assert!(matches!(
            pay_extended(&harness.state, &event, harness.now()).await,
            Err(WithdrawError::WrongRequestTag)
        ));
    }

    #[tokio::test]
    async fn test_info_is_read_only_and_layered() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let stored_before = harness
            .state
            .store
            .ntag_by_cid(&holder.ntag.cid)
            .await
            .unwrap()
            .unwrap();
        let (p, c) = harness.tap(&holder.ntag, stored_before.ctr + 1);
        let report = scan(&harness.state, &p, &c, ScanAction::Info, harness.now())
            .await
            .unwrap();
        assert_eq!(report["initialized"], true);
        assert_eq!(report["associated"], true);
        assert_eq!(report["activated"], true);
        assert_eq!(report["hasDelegation"], true);
        assert_eq!(report["ntag424"]["tapValid"], true);
        assert_eq!(report["card"]["enabled"], true);
        // Diagnostics never advance the counter.
        let stored_after = harness
            .state
            .store
            .ntag_by_cid(&holder.ntag.cid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_after.ctr, stored_before.ctr);
    }

    #[tokio::test]
    async fn test_identity_query_returns_signed_holder() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(
            &harness.state,
            &p,
            &c,
            ScanAction::IdentityQuery,
            harness.now(),
        )
        .await
        .unwrap();
        let event: Event = serde_json::from_value(response).unwrap();
        event.verify_signature().unwrap();
        assert_eq!(event.pubkey, harness.module_pubkey());
        assert_eq!(event.content, holder.pubkey.to_hex());
    }

    #[tokio::test]
    async fn test_pay_request_descriptor() {
        let harness = Harness::new().await;
        let holder = harness.activate_default_card().await;
        let (p, c) = harness.next_tap(&holder.ntag.cid).await;
        let response = scan(&harness.state, &p, &c, ScanAction::PayRequest, harness.now())
            .await
            .unwrap();
        assert_eq!(response["tag"], "payRequest");
        assert_eq!(
            response["callback"],
            format!("https://api.lawallet.ar/lnurlp/{}/callback", holder.pubkey)
        );
    }
}
