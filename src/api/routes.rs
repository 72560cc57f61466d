use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::engine::executor::{BuyRequest, SellRequest};
use crate::engine::TradeExecutor;
use crate::errors::EngineError;
use crate::models::now_ts;
use crate::notify::Notifier;
use crate::store::{self, SettlementStore, WithdrawalRow};
use crate::wallet::amount::parse_amount_micro;
use crate::wallet::custodian::CustodialProvider;
use crate::wallet::withdrawals::WithdrawalPipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: SettlementStore,
    pub executor: Arc<TradeExecutor>,
    pub withdrawals: Arc<WithdrawalPipeline>,
    pub custodian: Arc<dyn CustodialProvider>,
    pub notifier: Notifier,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/markets/:market_id/options/:option_id/buy", post(post_buy))
        .route("/api/markets/:market_id/options/:option_id/sell", post(post_sell))
        .route("/api/markets/:market_id/options/:option_id/claim", post(post_claim))
        .route("/api/withdrawals", post(post_withdrawal).get(get_withdrawals))
        .route("/api/withdrawals/:id", delete(delete_withdrawal))
        .route("/api/wallet", get(get_wallet))
        .route("/api/wallet/deposit-address", post(post_deposit_address))
        .route("/api/activity", get(get_activity))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The upstream auth layer injects the authenticated user id; the engine
/// only trusts this header.
fn user_id_from(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::from(EngineError::Validation("missing or invalid x-user-id".into())))
}

async fn post_buy(
    State(state): State<AppState>,
    Path((market_id, option_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(body): Json<TradeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let max_cost_micro = parse_amount_micro(&body.limit_amount()?)?;
    let outcome = state
        .executor
        .buy(BuyRequest {
            user_id,
            market_id,
            option_id,
            buy_yes: body.yes_amount.unwrap_or(0),
            buy_no: body.no_amount.unwrap_or(0),
            max_cost_micro,
            slippage_bps: body.slippage_bps.unwrap_or(0),
        })
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn post_sell(
    State(state): State<AppState>,
    Path((market_id, option_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(body): Json<TradeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let min_payout_micro = match &body.min_payout {
        Some(raw) => parse_amount_micro(raw)?,
        None => 0,
    };
    let outcome = state
        .executor
        .sell(SellRequest {
            user_id,
            market_id,
            option_id,
            sell_yes: body.yes_amount.unwrap_or(0),
            sell_no: body.no_amount.unwrap_or(0),
            min_payout_micro,
            slippage_bps: body.slippage_bps.unwrap_or(0),
        })
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn post_claim(
    State(state): State<AppState>,
    Path((market_id, option_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let outcome = state.executor.claim(user_id, market_id, option_id).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn post_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WithdrawalBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let receipt = state
        .withdrawals
        .request_withdrawal(user_id, &body.destination, &body.amount)
        .await?;
    Ok(Json(serde_json::to_value(receipt).unwrap_or_default()))
}

async fn delete_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let refunded = state.withdrawals.cancel_withdrawal(user_id, &id).await?;
    Ok(Json(json!({ "refunded_amount": refunded })))
}

async fn get_withdrawals(
    State(state): State<AppState>,
    Query(params): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<WithdrawalsResponse>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let withdrawals = state
        .withdrawals
        .history(user_id, params.page.unwrap_or(1), params.limit.unwrap_or(20))
        .await?;
    Ok(Json(WithdrawalsResponse {
        count: withdrawals.len(),
        withdrawals,
    }))
}

async fn get_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let wallet = state
        .store
        .read(|conn| store::get_wallet(conn, user_id))
        .await?;
    match wallet {
        Some(w) => Ok(Json(json!({
            "user_id": w.user_id,
            "balance_micro": w.balance,
            "deposit_address": w.deposit_address,
        }))),
        None => Ok(Json(json!({
            "user_id": user_id,
            "balance_micro": 0,
            "deposit_address": null,
        }))),
    }
}

/// Provision a custodial deposit account for the caller's wallet so the
/// deposit monitor starts tracking it.
async fn post_deposit_address(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let now = now_ts();

    let existing = state
        .store
        .read(|conn| store::get_wallet(conn, user_id))
        .await?
        .and_then(|w| w.deposit_address);
    if let Some(address) = existing {
        return Ok(Json(json!({ "deposit_address": address })));
    }

    let account = state.custodian.create_account(user_id).await?;
    state
        .store
        .with_tx(|tx| {
            store::ensure_wallet(tx, user_id, now)?;
            store::set_wallet_deposit_account(
                tx,
                user_id,
                &account.deposit_address,
                &account.account_id,
                now,
            )
        })
        .await?;
    Ok(Json(json!({ "deposit_address": account.deposit_address })))
}

async fn get_activity(
    State(state): State<AppState>,
    Query(params): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = user_id_from(&headers)?;
    let limit = params.limit.unwrap_or(50).min(200);
    let records = state
        .store
        .read(|conn| store::list_activity(conn, user_id, limit))
        .await?;
    Ok(Json(json!({ "count": records.len(), "activity": records })))
}

/// Fan out post-commit settlement events to a websocket subscriber.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.notifier.subscribe();
    ws.on_upgrade(move |socket| client_connection(socket, rx))
}

async fn client_connection(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<crate::models::WsServerEvent>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Ok(event) = event else { break };
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!("failed to serialize ws event: {}", e);
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".into())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct TradeBody {
    /// Micro-shares per side.
    yes_amount: Option<i64>,
    no_amount: Option<i64>,
    /// Decimal string, buys only.
    max_cost: Option<String>,
    /// Decimal string, sells only.
    min_payout: Option<String>,
    slippage_bps: Option<u32>,
}

impl TradeBody {
    fn limit_amount(&self) -> Result<String, ApiError> {
        self.max_cost.clone().ok_or_else(|| {
            ApiError::from(EngineError::Validation("max_cost is required".into()))
        })
    }
}

#[derive(Deserialize)]
struct WithdrawalBody {
    destination: String,
    amount: String,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct WithdrawalsResponse {
    count: usize,
    withdrawals: Vec<WithdrawalRow>,
}

// ===== Error Handling =====

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) | EngineError::Precision(_) => StatusCode::BAD_REQUEST,
        EngineError::InsufficientBalance { .. }
        | EngineError::InsufficientShares { .. }
        | EngineError::InsufficientLiquidity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::DuplicateRequest { .. } | EngineError::AlreadyClaimed => StatusCode::CONFLICT,
        EngineError::RateLimited { .. } | EngineError::Cooldown { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        EngineError::DisputeWindowOpen { .. } => StatusCode::TOO_EARLY,
        EngineError::QueueTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        EngineError::ExternalServiceUnavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::Busy | EngineError::Storage(_) | EngineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let (code, message, detail) = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {}", self.0);
            (
                "internal_error",
                "Internal server error".to_string(),
                serde_json::Value::Null,
            )
        } else {
            (self.0.code(), self.0.to_string(), self.0.detail())
        };

        let body = Json(json!({
            "error": code,
            "message": message,
            "detail": detail,
        }));
        (status, body).into_response()
    }
}
