//! Engine input commands
//!
//! Commands travel on `orders.<market>` in bincode form and are consumed by
//! exactly one engine. All monetary fields are scaled integers.

use serde::{Deserialize, Serialize};

use common::{OrderStatus, OrderType, OtoType, Side, StopKind, TrailingPriceType};

use crate::Result;

/// A primitive order as the engine sees it
///
/// `order_type` is one of `Limit`, `Market` or `TrailingStop`; composite
/// types are decomposed before they reach an engine. The advanced-order
/// fields ride along so the command log is a complete record of the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCommand {
    pub id: u64,
    pub owner_id: u64,
    pub sub_account: u64,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub stop: StopKind,
    /// Base amount (scaled by base precision)
    pub amount: u64,
    /// Limit price (scaled by quote precision)
    pub price: u64,
    pub stop_price: u64,
    /// Spendable quote for market buys
    pub funds: u64,
    pub take_profit_price: u64,
    pub stop_loss_price: u64,
    pub trailing_stop_activation_price: u64,
    pub trailing_stop_price: u64,
    pub trailing_stop_price_type: TrailingPriceType,
    /// Last recorded trailing watermark, zero when not yet armed
    pub trailing_watermark: u64,
    pub oto_type: OtoType,
    pub status: OrderStatus,
    pub filled_amount: u64,
    pub used_funds: u64,
}

impl OrderCommand {
    /// A fresh command with every optional field zeroed.
    pub fn new(
        id: u64,
        owner_id: u64,
        sub_account: u64,
        market_id: impl Into<String>,
        side: Side,
        order_type: OrderType,
    ) -> Self {
        Self {
            id,
            owner_id,
            sub_account,
            market_id: market_id.into(),
            side,
            order_type,
            stop: StopKind::None,
            amount: 0,
            price: 0,
            stop_price: 0,
            funds: 0,
            take_profit_price: 0,
            stop_loss_price: 0,
            trailing_stop_activation_price: 0,
            trailing_stop_price: 0,
            trailing_stop_price_type: TrailingPriceType::Absolute,
            trailing_watermark: 0,
            oto_type: OtoType::Limit,
            status: OrderStatus::Pending,
            filled_amount: 0,
            used_funds: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.filled_amount)
    }

    pub fn is_stop(&self) -> bool {
        self.stop != StopKind::None
    }
}

/// Cancel request for a live order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCommand {
    pub id: u64,
    pub market_id: String,
    pub owner_id: u64,
    pub sub_account: u64,
}

/// Engine input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    NewOrder(OrderCommand),
    CancelOrder(CancelCommand),
    /// Cancel `old_id`, then place `order` in the same step
    ReplaceOrder { old_id: u64, order: OrderCommand },
}

impl Command {
    pub fn market_id(&self) -> &str {
        match self {
            Command::NewOrder(order) => &order.market_id,
            Command::CancelOrder(cancel) => &cancel.market_id,
            Command::ReplaceOrder { order, .. } => &order.market_id,
        }
    }

    /// Id of the order this command creates or cancels
    pub fn order_id(&self) -> u64 {
        match self {
            Command::NewOrder(order) => order.id,
            Command::CancelOrder(cancel) => cancel.id,
            Command::ReplaceOrder { order, .. } => order.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::NewOrder(_) => "new",
            Command::CancelOrder(_) => "cancel",
            Command::ReplaceOrder { .. } => "replace",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
