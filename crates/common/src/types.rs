//! Common types used across SpotX
//!
//! This module provides the fundamental domain types used throughout
//! the trading core. Monetary fields are scaled integers (see
//! [`crate::decimal`]).

use serde::{Deserialize, Serialize};

use crate::decimal;
use crate::error::Result;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Returns true if this is a buy order
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Returns true if this is a sell order
    pub fn is_sell(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type
///
/// `Limit`, `Market` and `TrailingStop` are engine primitives. The others
/// are orchestrated into primitives before they reach an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    /// One-cancels-other
    Oco,
    /// One-triggers-other
    Oto,
    Straddle,
    Strangle,
    TrailingStop,
}

impl OrderType {
    /// Root orders that hold funds but never enter the engine.
    pub fn is_container(&self) -> bool {
        matches!(self, OrderType::Oco | OrderType::Straddle | OrderType::Strangle)
    }

    /// Types the matching engine executes directly.
    pub fn is_engine_primitive(&self) -> bool {
        matches!(
            self,
            OrderType::Limit | OrderType::Market | OrderType::TrailingStop
        )
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
            OrderType::Oco => "oco",
            OrderType::Oto => "oto",
            OrderType::Straddle => "straddle",
            OrderType::Strangle => "strangle",
            OrderType::TrailingStop => "trailing_stop",
        };
        write!(f, "{}", s)
    }
}

/// Stop behaviour of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    #[default]
    None,
    /// Activated by adverse price motion
    Loss,
    /// Activated by favourable price motion
    Entry,
}

impl StopKind {
    /// Whether a stop on `side` with trigger `stop_price` fires at `last_price`.
    ///
    /// Sell-loss and buy-entry fire on falling prices, sell-entry and
    /// buy-loss on rising prices.
    pub fn is_triggered(&self, side: Side, stop_price: u64, last_price: u64) -> bool {
        match (self, side) {
            (StopKind::None, _) => false,
            (StopKind::Loss, Side::Sell) | (StopKind::Entry, Side::Buy) => {
                last_price <= stop_price
            }
            (StopKind::Entry, Side::Sell) | (StopKind::Loss, Side::Buy) => {
                last_price >= stop_price
            }
        }
    }

    /// Whether this stop fires when the price falls to its trigger.
    pub fn fires_on_fall(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (StopKind::Loss, Side::Sell) | (StopKind::Entry, Side::Buy)
        )
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted by intake, not yet seen by the engine
    Pending,
    /// Live in the engine with no fills
    Untouched,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Untouched => "untouched",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "untouched" => Ok(OrderStatus::Untouched),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// How a trailing-stop offset is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrailingPriceType {
    /// Offset in quote price units
    #[default]
    Absolute,
    /// Offset in 1/10 000 of the watermark
    Percentage,
}

impl TrailingPriceType {
    /// Distance between watermark and trigger.
    pub fn offset(&self, watermark: u64, trailing_price: u64) -> u64 {
        match self {
            TrailingPriceType::Absolute => trailing_price,
            TrailingPriceType::Percentage => {
                decimal::apply_bps(watermark, trailing_price).unwrap_or(u64::MAX)
            }
        }
    }
}

/// Parent order flavour of an OTO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OtoType {
    /// Limit parent, absolute child prices
    #[default]
    Limit,
    /// Market parent, child prices relative to the fill price
    Market,
}

/// Balance owner: a user and one of their sub-accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: u64,
    pub sub_account: u64,
}

impl AccountKey {
    pub fn new(user_id: u64, sub_account: u64) -> Self {
        Self {
            user_id,
            sub_account,
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.sub_account)
    }
}

/// Trading state of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    #[default]
    Active,
    Disabled,
}

/// A trading pair with its precisions and limits
///
/// Volumes, prices and spend limits are scaled integers; a zero maximum
/// disables that cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub base: String,
    pub quote: String,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub min_base_volume: u64,
    pub min_quote_volume: u64,
    /// Largest accepted order amount
    pub max_base_price: u64,
    /// Largest accepted limit or stop price
    pub max_quote_price: u64,
    /// Largest quote value of a single order
    pub max_quote_spend: u64,
    pub status: MarketStatus,
}

impl Market {
    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    /// Coin locked by an order on `side`.
    pub fn funds_coin(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.quote,
            Side::Sell => &self.base,
        }
    }

    /// Coin received by an order on `side`.
    pub fn receive_coin(&self, side: Side) -> &str {
        match side {
            Side::Buy => &self.base,
            Side::Sell => &self.quote,
        }
    }

    /// Quote value of `amount` at `price`.
    pub fn quote_value(&self, price: u64, amount: u64) -> Result<u64> {
        decimal::quote_amount(price, amount, self.base_precision)
    }

    pub fn format_price(&self, price: u64) -> String {
        decimal::from_scaled(price, self.quote_precision)
    }

    pub fn format_amount(&self, amount: u64) -> String {
        decimal::from_scaled(amount, self.base_precision)
    }

    pub fn parse_price(&self, price: &str) -> Result<u64> {
        decimal::to_scaled(price, self.quote_precision)
    }

    pub fn parse_amount(&self, amount: &str) -> Result<u64> {
        decimal::to_scaled(amount, self.base_precision)
    }
}
