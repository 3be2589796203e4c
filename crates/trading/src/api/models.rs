//! API models for the trading HTTP endpoints
//!
//! Prices and amounts travel as decimal strings in the market's precision
//! and are scaled at the edge; everything behind the API is integer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use common::{Market, OrderStatus, OrderType, OtoType, Side, StopKind, TrailingPriceType};
use fms::BalanceCell;
use oms::{Order, StatusFilter, TradeRecord};

use crate::cancel::CancelOutcome;

/// Request to create (or replace with) an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub market: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub stop: StopKind,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub opposite_stop_price: Option<String>,
    /// Quote to spend on a market buy
    #[serde(default)]
    pub funds: Option<String>,
    #[serde(default)]
    pub tp_price: Option<String>,
    #[serde(default)]
    pub sl_price: Option<String>,
    /// 1/10 000 of the fill price
    #[serde(default)]
    pub tp_rel: u64,
    #[serde(default)]
    pub sl_rel: u64,
    #[serde(default)]
    pub oto_type: OtoType,
    #[serde(default)]
    pub trailing_stop_activation_price: Option<String>,
    /// A price, or 1/10 000 of the watermark for `percentage`
    #[serde(default)]
    pub trailing_stop_price: Option<String>,
    #[serde(default)]
    pub trailing_stop_price_type: TrailingPriceType,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub ui: Option<String>,
}

/// Single order in API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: u64,
    pub client_order_id: Option<String>,
    pub market: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub stop: StopKind,
    pub status: OrderStatus,
    pub price: String,
    pub amount: String,
    pub filled_amount: String,
    pub filled_quote: String,
    pub average_price: Option<String>,
    pub stop_price: String,
    pub fee_amount: u64,
    pub locked_funds: u64,
    pub used_funds: u64,
    pub triggered: bool,
    pub parent_order_id: Option<u64>,
    pub root_order_id: Option<u64>,
    pub tp_order_id: Option<u64>,
    pub sl_order_id: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrderResponse {
    pub fn new(order: &Order, market: &Market) -> Self {
        let average_price = order
            .average_price(market.base_precision)
            .ok()
            .flatten()
            .map(|p| market.format_price(p));
        Self {
            id: order.id,
            client_order_id: order.client_order_id.clone(),
            market: order.market_id.clone(),
            side: order.side,
            order_type: order.order_type,
            stop: order.stop,
            status: order.status,
            price: market.format_price(order.price),
            amount: market.format_amount(order.amount),
            filled_amount: market.format_amount(order.filled_amount),
            filled_quote: market.format_price(order.filled_quote),
            average_price,
            stop_price: market.format_price(order.stop_price),
            fee_amount: order.fee_amount,
            locked_funds: order.locked_funds,
            used_funds: order.used_funds,
            triggered: order.triggered,
            parent_order_id: order.parent_order_id,
            root_order_id: order.root_order_id,
            tp_order_id: order.tp_order_id,
            sl_order_id: order.sl_order_id,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Query of `GET /api/orders`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOrdersQuery {
    #[serde(default)]
    pub status: Option<StatusFilter>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    /// Nanoseconds since the Unix epoch, inclusive
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
    #[serde(default)]
    pub page: usize,
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradesQuery {
    pub market: String,
    #[serde(default = "default_trades_limit")]
    pub limit: usize,
}

fn default_trades_limit() -> usize {
    100
}

/// Public trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponse {
    pub id: u64,
    pub market: String,
    pub price: String,
    pub volume: String,
    pub quote_volume: String,
    pub taker_side: Side,
    pub created_at: i64,
}

impl TradeResponse {
    pub fn new(trade: &TradeRecord, market: &Market) -> Self {
        Self {
            id: trade.id,
            market: trade.market_id.clone(),
            price: market.format_price(trade.price),
            volume: market.format_amount(trade.volume),
            quote_volume: market.format_price(trade.quote_volume),
            taker_side: trade.taker_side,
            created_at: trade.created_at,
        }
    }
}

/// Result of `DELETE /api/orders/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub result: String,
}

impl From<CancelOutcome> for CancelResponse {
    fn from(outcome: CancelOutcome) -> Self {
        let result = match outcome {
            CancelOutcome::SendingFailed | CancelOutcome::CancelFailedFromMe => "cancel_failed",
            other => other.as_str(),
        };
        Self {
            result: result.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: String,
    pub amount: String,
    pub orders: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthResponse {
    pub market: String,
    pub seq_id: u64,
    pub last_price: Option<String>,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancesResponse {
    pub user_id: u64,
    pub sub_account: u64,
    pub balances: BTreeMap<String, BalanceCell>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub coin: String,
    /// Scaled integer in the coin's precision
    pub amount: u64,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalResponse {
    pub withdrawal_id: String,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub markets: Vec<String>,
    pub halted: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

/// Error detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
