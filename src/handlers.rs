//! HTTP endpoints of the card module.
//!
//! Bodies are signed event JSON unless noted; responses are JSON. Errors
//! map onto a small taxonomy — malformed input (400/422), authentication
//! (422), not found (404), conflict (409), exhausted (400 with
//! `{status:"ERROR", reason}`), internal (500). Tap-verification failures
//! are deliberately collapsed to one opaque reason outside the diagnostic
//! `info` action.

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::instrument;

use crate::app::AppState;
use crate::config_channel::{self, ConfigChannelError};
use crate::lifecycle::{self, LifecycleError, ResetRequest};
use crate::nostr::Event;
use crate::nostr::event::topics;
use crate::nostr::preflight::preflight;
use crate::payment_request::ConsumeError;
use crate::store::StoreError;
use crate::sun::SunError;
use crate::timestamp::UnixTimestamp;
use crate::withdraw::{self, ScanAction, WithdrawError};

/// Opaque reason for every tap-verification failure (§ error policy).
const CARD_DATA_UNAVAILABLE: &str = "Failed to retrieve card data";

static ACTION_GRAMMAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9.-]+$").expect("static pattern"));

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route(
            "/ntag424",
            post(post_ntag424).patch(patch_ntag424).delete(delete_ntag424),
        )
        .route("/card", post(post_card))
        .route("/card/scan", get(get_card_scan))
        .route("/card/pay", get(get_card_pay).post(post_card_pay))
        .route("/card/data/request", post(post_card_data_request))
        .route("/card/config/request", post(post_card_config_request))
        .route("/card/publish-data", post(post_card_publish_data))
        .route("/card/reset/request", post(post_card_reset_request))
        .route("/card/reset/claim", post(post_card_reset_claim))
}

/// API error carrying its HTTP status and a wire-visible reason.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            ApiError::NotFound(reason) => (StatusCode::NOT_FOUND, reason),
            ApiError::Conflict(reason) => (StatusCode::CONFLICT, reason),
            ApiError::Unprocessable(reason) => (StatusCode::UNPROCESSABLE_ENTITY, reason),
            ApiError::Internal(reason) => (StatusCode::INTERNAL_SERVER_ERROR, reason),
        };
        (status, Json(json!({ "status": "ERROR", "reason": reason }))).into_response()
    }
}

/// Tap-verifier failures on public paths: one opaque reason, split only
/// into "bad request" and "not found" status classes.
impl From<SunError> for ApiError {
    fn from(error: SunError) -> Self {
        match error {
            SunError::PiccShape
            | SunError::PiccTag
            | SunError::CmacShape
            | SunError::CounterNotAdvanced { .. } => {
                ApiError::BadRequest(CARD_DATA_UNAVAILABLE.to_string())
            }
            SunError::NotFound | SunError::CmacMismatch => {
                ApiError::NotFound(CARD_DATA_UNAVAILABLE.to_string())
            }
            SunError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => ApiError::NotFound(error.to_string()),
            StoreError::DesignNotFound => ApiError::Unprocessable(error.to_string()),
            StoreError::DuplicateCid(_)
            | StoreError::OtcConflict { .. }
            | StoreError::OtcTaken { .. }
            | StoreError::CardExists(_)
            | StoreError::NtagInUse(_) => ApiError::Conflict(error.to_string()),
            StoreError::AlreadyUsed => {
                ApiError::BadRequest(format!("invalid transaction: {error}"))
            }
            StoreError::Backend(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<ConfigChannelError> for ApiError {
    fn from(error: ConfigChannelError) -> Self {
        match error {
            ConfigChannelError::Store(e) => e.into(),
            ConfigChannelError::Outbox(e) => ApiError::Internal(e.to_string()),
            ConfigChannelError::HolderUnknown => ApiError::Unprocessable(error.to_string()),
            ConfigChannelError::Envelope(_)
            | ConfigChannelError::Nip04(_)
            | ConfigChannelError::Malformed(_) => ApiError::Unprocessable(error.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Preflight(_)
            | LifecycleError::Malformed(_)
            | LifecycleError::Delegation(_)
            | LifecycleError::Nip04(_)
            | LifecycleError::BadDonation(_) => ApiError::Unprocessable(error.to_string()),
            LifecycleError::Sun(e) => match e {
                SunError::NotFound | SunError::CmacMismatch => {
                    ApiError::NotFound(CARD_DATA_UNAVAILABLE.to_string())
                }
                SunError::Store(e) => e.into(),
                _ => ApiError::Unprocessable(CARD_DATA_UNAVAILABLE.to_string()),
            },
            LifecycleError::Store(e) => e.into(),
            LifecycleError::Channel(e) => e.into(),
            LifecycleError::Outbox(e) => ApiError::Internal(e.to_string()),
            LifecycleError::NoAvailableNtag => ApiError::NotFound(error.to_string()),
            LifecycleError::NotActivated => ApiError::NotFound(error.to_string()),
            LifecycleError::ResetTokenInvalid => ApiError::Unprocessable(error.to_string()),
            LifecycleError::AdminRequired
            | LifecycleError::TargetIsAdmin
            | LifecycleError::SameCard => ApiError::BadRequest(error.to_string()),
        }
    }
}

impl From<WithdrawError> for ApiError {
    fn from(error: WithdrawError) -> Self {
        match error {
            WithdrawError::Sun(e) => e.into(),
            WithdrawError::Store(e) => e.into(),
            WithdrawError::NotActivated => ApiError::NotFound(CARD_DATA_UNAVAILABLE.to_string()),
            WithdrawError::CardDisabled => ApiError::BadRequest(error.to_string()),
            WithdrawError::Consume(e) => match e {
                ConsumeError::Store(e) => e.into(),
                _ => ApiError::BadRequest(format!("invalid transaction: {e}")),
            },
            WithdrawError::Ledger(e) => ApiError::Internal(e.to_string()),
            WithdrawError::Preflight(_) | WithdrawError::Malformed(_) | WithdrawError::Pubkey(_) => {
                ApiError::BadRequest(error.to_string())
            }
            WithdrawError::Invoice(_)
            | WithdrawError::InvoiceExpired
            | WithdrawError::WrongRequestTag
            | WithdrawError::NoTokens
            | WithdrawError::TokenNotOffered(_)
            | WithdrawError::ExceedsMax(_)
            | WithdrawError::ExceedsRemaining(_)
            | WithdrawError::ExceedsBalance(_)
            | WithdrawError::NoDelegation => ApiError::BadRequest(error.to_string()),
        }
    }
}

fn now() -> Result<UnixTimestamp, ApiError> {
    UnixTimestamp::try_now().map_err(|e| ApiError::Internal(format!("system clock: {e}")))
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    p: String,
    c: String,
}

#[derive(Debug, Deserialize)]
struct PayQuery {
    k1: String,
    pr: String,
}

/// Parse the `X-LaWallet-Action` / `X-LaWallet-Param` headers.
///
/// The action only applies when the `federationId` parameter names this
/// module's federation; otherwise the standard scan path runs.
fn parse_scan_action(headers: &HeaderMap, state: &AppState) -> Result<ScanAction, ApiError> {
    let Some(action) = headers
        .get("X-LaWallet-Action")
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(ScanAction::Standard);
    };
    if !ACTION_GRAMMAR.is_match(action) {
        return Err(ApiError::BadRequest(format!(
            "malformed X-LaWallet-Action {action:?}"
        )));
    }
    let params: std::collections::HashMap<String, String> = headers
        .get("X-LaWallet-Param")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    Some((key.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    if params.get("federationId") != Some(&state.config.federation_id) {
        return Ok(ScanAction::Standard);
    }
    match action {
        "extendedScan" => {
            let tokens = params
                .get("tokens")
                .map(|raw| {
                    raw.split(':')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(ScanAction::Extended { tokens })
        }
        "identityQuery" => Ok(ScanAction::IdentityQuery),
        "info" => Ok(ScanAction::Info),
        "payRequest" => Ok(ScanAction::PayRequest),
        other => Err(ApiError::BadRequest(format!(
            "unknown X-LaWallet-Action {other:?}"
        ))),
    }
}

/// `GET /`: service greeting.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: readiness probe.
#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

/// `POST /ntag424`: initialize an NTAG (card writer only).
#[instrument(skip_all)]
async fn post_ntag424(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Response, ApiError> {
    let response = lifecycle::initialize(&state, &event, now()?).await?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// `PATCH /ntag424?p&c`: associate a one-time code (card writer only).
#[instrument(skip_all)]
async fn patch_ntag424(
    State(state): State<AppState>,
    Query(tap): Query<TapQuery>,
    Json(event): Json<Event>,
) -> Result<Response, ApiError> {
    lifecycle::associate(&state, &tap.p, &tap.c, &event, now()?).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `DELETE /ntag424`: admin delete of an unused NTAG (card writer only).
#[instrument(skip_all)]
async fn delete_ntag424(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Response, ApiError> {
    lifecycle::delete(&state, &event, now()?).await?;
    Ok(Json(json!({ "status": "OK" })).into_response())
}

/// `POST /card`: activation or transfer acceptance, dispatched by the
/// request's `t` tag.
#[instrument(skip_all)]
async fn post_card(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Response, ApiError> {
    match event.topic() {
        Some(topics::CARD_ACTIVATION_REQUEST) => {
            let (response, _card) = lifecycle::activate(&state, &event, now()?).await?;
            Ok((StatusCode::CREATED, Json(response)).into_response())
        }
        Some(topics::CARD_TRANSFER_ACCEPTANCE) => {
            let (response, _card) = lifecycle::transfer(&state, &event, now()?).await?;
            Ok((StatusCode::OK, Json(response)).into_response())
        }
        other => Err(ApiError::Unprocessable(format!(
            "unsupported request tag {other:?}"
        ))),
    }
}

/// `GET /card/scan?p&c`: scan dispatch.
#[instrument(skip_all)]
async fn get_card_scan(
    State(state): State<AppState>,
    Query(tap): Query<TapQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let action = parse_scan_action(&headers, &state)?;
    let response = withdraw::scan(&state, &tap.p, &tap.c, action, now()?).await?;
    Ok(Json(response))
}

/// `GET /card/pay?k1&pr`: standard LNURL-withdraw callback.
#[instrument(skip_all)]
async fn get_card_pay(
    State(state): State<AppState>,
    Query(pay): Query<PayQuery>,
) -> Result<Json<Value>, ApiError> {
    let response = withdraw::pay_lud03(&state, &pay.k1, &pay.pr, now()?).await?;
    Ok(Json(response))
}

/// `POST /card/pay`: extended multi-token withdraw.
#[instrument(skip_all)]
async fn post_card_pay(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<Value>, ApiError> {
    let response = withdraw::pay_extended(&state, &event, now()?).await?;
    Ok(Json(response))
}

/// Preflight a holder-signed request and require the holder on file.
async fn known_holder(
    state: &AppState,
    event: &Event,
    now: UnixTimestamp,
) -> Result<crate::types::PublicKey, ApiError> {
    let resolved =
        preflight(event, now, None).map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    match state.store.holder(&resolved.pubkey).await {
        Ok(Some(_)) => Ok(resolved.pubkey),
        Ok(None) => Err(ApiError::Unprocessable("holder unknown".to_string())),
        Err(e) => Err(e.into()),
    }
}

/// `POST /card/data/request`: publish and return the card-data event.
#[instrument(skip_all)]
async fn post_card_data_request(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<Event>, ApiError> {
    let now = now()?;
    let holder = known_holder(&state, &event, now).await?;
    let published = config_channel::publish_card_data(&state, &holder, now).await?;
    Ok(Json(published))
}

/// `POST /card/config/request`: publish and return the current
/// card-config event.
#[instrument(skip_all)]
async fn post_card_config_request(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<Event>, ApiError> {
    let now = now()?;
    let holder = known_holder(&state, &event, now).await?;
    let published = config_channel::publish_card_config(&state, &holder, None, now).await?;
    Ok(Json(published))
}

/// `POST /card/publish-data`: republish card-data for the holder.
#[instrument(skip_all)]
async fn post_card_publish_data(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<Value>, ApiError> {
    let now = now()?;
    let holder = known_holder(&state, &event, now).await?;
    config_channel::publish_card_data(&state, &holder, now).await?;
    Ok(Json(json!({ "status": "OK" })))
}

/// `POST /card/reset/request`: admin begins a reset with two taps.
#[instrument(skip_all)]
async fn post_card_reset_request(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = lifecycle::admin_reset_request(&state, &request, now()?).await?;
    Ok(Json(json!({ "otc": token })))
}

/// `POST /card/reset/claim`: the holder's new key claims the reset.
#[instrument(skip_all)]
async fn post_card_reset_claim(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Response, ApiError> {
    let outcome = lifecycle::admin_reset_claim(&state, &event, now()?).await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}
