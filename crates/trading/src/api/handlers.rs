//! API handlers for the trading HTTP endpoints

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::warn;

use common::{AccountKey, Market, TrailingPriceType};
use oms::OrderFilter;

use crate::api::models::*;
use crate::error::{ErrorKind, TradingError};
use crate::exchange::Exchange;
use crate::intake::OrderRequest;

pub const USER_HEADER: &str = "x-user-id";
pub const SUB_ACCOUNT_HEADER: &str = "x-sub-account";

pub struct TradingApiState {
    pub exchange: Arc<Exchange>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_body(status: StatusCode, code: &str, message: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        }),
    )
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable | ErrorKind::TransientStorage => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ProjectionCorruption | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<TradingError> for ErrorResponse {
    fn from(e: TradingError) -> Self {
        ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: e.kind().code().to_string(),
                message: e.to_string(),
                details: None,
            },
        }
    }
}

fn reject(e: TradingError) -> ApiError {
    let status = status_for(e.kind());
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, Json(ErrorResponse::from(e)))
}

/// Caller identity taken from `X-User-Id` / `X-Sub-Account`
///
/// Authentication happens in front of this service; the headers are
/// trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub AccountKey);

fn header_u64(parts: &Parts, name: &str) -> Result<Option<u64>, ApiError> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            error_body(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("header {} must be an unsigned integer", name),
            )
        })
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_u64(parts, USER_HEADER)?.ok_or_else(|| {
            error_body(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                format!("missing {} header", USER_HEADER),
            )
        })?;
        let sub_account = header_u64(parts, SUB_ACCOUNT_HEADER)?.unwrap_or(0);
        Ok(Caller(AccountKey::new(user_id, sub_account)))
    }
}

/// Decimal string to a scaled integer; absent or blank is zero
fn scaled(
    field: &str,
    value: Option<&str>,
    parse: impl Fn(&str) -> common::Result<u64>,
) -> Result<u64, TradingError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(v) => parse(v).map_err(|e| TradingError::validation(format!("{}: {}", field, e))),
    }
}

fn bps(field: &str, value: Option<&str>) -> Result<u64, TradingError> {
    scaled(field, value, |v| {
        v.parse::<u64>()
            .map_err(|e| common::Error::invalid_amount(format!("{}: {}", v, e)))
    })
}

/// Scale an API request into an intake request for `market`
pub fn order_request(
    owner: AccountKey,
    market: &Market,
    req: &CreateOrderRequest,
) -> Result<OrderRequest, TradingError> {
    let price = |field: &str, value: &Option<String>| {
        scaled(field, value.as_deref(), |v| market.parse_price(v))
    };

    let mut request = OrderRequest::new(owner, market.id.clone(), req.side, req.order_type);
    request.stop = req.stop;
    request.price = price("price", &req.price)?;
    request.amount = scaled("amount", req.amount.as_deref(), |v| market.parse_amount(v))?;
    request.stop_price = price("stop_price", &req.stop_price)?;
    request.opposite_stop_price = price("opposite_stop_price", &req.opposite_stop_price)?;
    request.funds = price("funds", &req.funds)?;
    request.tp_price = price("tp_price", &req.tp_price)?;
    request.sl_price = price("sl_price", &req.sl_price)?;
    request.tp_rel = req.tp_rel;
    request.sl_rel = req.sl_rel;
    request.oto_type = req.oto_type;
    request.trailing_stop_activation_price = price(
        "trailing_stop_activation_price",
        &req.trailing_stop_activation_price,
    )?;
    request.trailing_stop_price_type = req.trailing_stop_price_type;
    request.trailing_stop_price = match req.trailing_stop_price_type {
        TrailingPriceType::Absolute => price("trailing_stop_price", &req.trailing_stop_price)?,
        TrailingPriceType::Percentage => {
            bps("trailing_stop_price", req.trailing_stop_price.as_deref())?
        }
    };
    request.client_order_id = req.client_order_id.clone();
    request.ui = req.ui.clone();
    Ok(request)
}

fn market_of(state: &TradingApiState, market_id: &str) -> Result<Market, ApiError> {
    state
        .exchange
        .projector()
        .market(market_id)
        .cloned()
        .map_err(|e| reject(e.into()))
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<TradingApiState>>) -> Json<HealthResponse> {
    let registry = state.exchange.registry();
    let halted = registry.halted();
    Json(HealthResponse {
        status: if halted.is_empty() { "healthy" } else { "degraded" }.to_string(),
        service: "spotx".to_string(),
        markets: registry.ids(),
        halted,
    })
}

/// Create order handler
pub async fn create_order(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<OrderResponse> {
    let market = market_of(&state, &req.market)?;
    let request = order_request(owner, &market, &req).map_err(reject)?;
    let order = state
        .exchange
        .intake()
        .create_order(request)
        .await
        .map_err(reject)?;
    Ok(Json(OrderResponse::new(&order, &market)))
}

/// Replace order handler
pub async fn replace_order(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Path(order_id): Path<u64>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<OrderResponse> {
    let market = market_of(&state, &req.market)?;
    let request = order_request(owner, &market, &req).map_err(reject)?;
    let order = state
        .exchange
        .intake()
        .replace_order(order_id, request)
        .await
        .map_err(reject)?;
    Ok(Json(OrderResponse::new(&order, &market)))
}

/// Cancel order handler; blocks until the engine answered or the
/// compensating cancel ran
pub async fn cancel_order(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Path(order_id): Path<u64>,
) -> ApiResult<CancelResponse> {
    let outcome = state
        .exchange
        .cancels()
        .cancel_order(owner, order_id)
        .await
        .map_err(reject)?;
    Ok(Json(CancelResponse::from(outcome)))
}

/// Get order handler
pub async fn get_order(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Path(order_id): Path<u64>,
) -> ApiResult<OrderResponse> {
    let projector = state.exchange.projector();
    let order = match projector.orders().locate(order_id) {
        Some(order) => Some(order),
        None => projector
            .store()
            .get_order(order_id)
            .await
            .map_err(|e| reject(e.into()))?,
    }
    .filter(|o| o.owner() == owner)
    .ok_or_else(|| reject(TradingError::NotFound(order_id)))?;

    let market = market_of(&state, &order.market_id)?;
    Ok(Json(OrderResponse::new(&order, &market)))
}

/// List orders handler
pub async fn list_orders(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Query(query): Query<ListOrdersQuery>,
) -> ApiResult<OrderListResponse> {
    let filter = OrderFilter {
        owner_id: Some(owner.user_id),
        sub_account: Some(owner.sub_account),
        market_id: query.market.clone(),
        status: query.status,
        side: query.side,
        from: query.from,
        to: query.to,
        limit: query.limit,
        page: query.page,
    };
    let projector = state.exchange.projector();
    let orders = projector
        .store()
        .list_orders(&filter)
        .await
        .map_err(|e| reject(e.into()))?;

    let mut responses = Vec::with_capacity(orders.len());
    for order in &orders {
        let market = market_of(&state, &order.market_id)?;
        responses.push(OrderResponse::new(order, &market));
    }
    Ok(Json(OrderListResponse {
        orders: responses,
        page: query.page,
        limit: query.limit,
    }))
}

/// Recent public trades handler
pub async fn list_trades(
    State(state): State<Arc<TradingApiState>>,
    Query(query): Query<TradesQuery>,
) -> ApiResult<Vec<TradeResponse>> {
    let market = market_of(&state, &query.market)?;
    let trades = state
        .exchange
        .projector()
        .store()
        .recent_trades(&market.id, query.limit.min(1_000))
        .await
        .map_err(|e| reject(e.into()))?;
    Ok(Json(
        trades.iter().map(|t| TradeResponse::new(t, &market)).collect(),
    ))
}

/// Order book depth handler
pub async fn get_depth(
    State(state): State<Arc<TradingApiState>>,
    Path(market_id): Path<String>,
) -> ApiResult<DepthResponse> {
    let market = market_of(&state, &market_id)?;
    let handle = state
        .exchange
        .registry()
        .get(&market.id)
        .ok_or_else(|| reject(TradingError::EngineUnavailable(market.id.clone())))?;

    let snapshot = handle.depth();
    let level = |l: &matching_engine::PriceLevel| DepthLevel {
        price: market.format_price(l.price),
        amount: market.format_amount(l.amount),
        orders: l.order_count,
    };
    Ok(Json(DepthResponse {
        market: market.id.clone(),
        seq_id: snapshot.seq_id,
        last_price: snapshot.last_price.map(|p| market.format_price(p)),
        bids: snapshot.bids.iter().map(level).collect(),
        asks: snapshot.asks.iter().map(level).collect(),
    }))
}

/// Caller balances handler
pub async fn get_balances(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
) -> ApiResult<BalancesResponse> {
    let balances = state.exchange.funds().balances(owner).await;
    Ok(Json(BalancesResponse {
        user_id: owner.user_id,
        sub_account: owner.sub_account,
        balances,
    }))
}

/// Withdrawal request handler
pub async fn request_withdrawal(
    State(state): State<Arc<TradingApiState>>,
    Caller(owner): Caller,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<WithdrawalResponse> {
    let withdrawal_id = state
        .exchange
        .wallet()
        .request_withdrawal(owner, &req.coin, req.amount, &req.address)
        .await
        .map_err(reject)?;
    Ok(Json(WithdrawalResponse { withdrawal_id }))
}
