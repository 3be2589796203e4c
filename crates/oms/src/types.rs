//! Order Management System domain types
//!
//! Every order the exchange knows about is an [`Order`]: engine primitives
//! (limit, market, trailing stop), OTO parents, and the container roots of
//! OCO and straddle/strangle orders together with their legs. Parent/child
//! links are plain ids; the root id is denormalised on every descendant.

use serde::{Deserialize, Serialize};

use common::decimal;
use common::{
    AccountKey, Market, OrderStatus, OrderType, OtoType, Side, StopKind, TrailingPriceType,
};
use matching_engine::{OrderCommand, Trade};

use crate::Result;

/// Order in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Global monotonic identifier
    pub id: u64,
    /// Client-specified order ID
    pub client_order_id: Option<String>,
    pub owner_id: u64,
    pub sub_account: u64,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub stop: StopKind,
    pub price: u64,
    pub amount: u64,
    pub stop_price: u64,
    /// Lower trigger of a straddle/strangle
    pub opposite_stop_price: u64,
    /// Funds locked in FMS; for legs, the claim on the container's lock
    pub locked_funds: u64,
    /// Funds consumed by fills (quote for buys, base for sells)
    pub used_funds: u64,
    /// Base consumed by the sell leg of a straddle/strangle
    pub opposite_used_funds: u64,
    pub filled_amount: u64,
    /// Quote volume traded, used for average price
    pub filled_quote: u64,
    /// Fees charged, in the coin this order receives
    pub fee_amount: u64,
    pub status: OrderStatus,
    /// Nanoseconds since the Unix epoch
    pub created_at: i64,
    pub updated_at: i64,

    // Advanced-order extensions
    pub tp_price: u64,
    pub sl_price: u64,
    /// Relative offsets in 1/10 000 of the fill price
    pub tp_rel: u64,
    pub sl_rel: u64,
    pub oto_type: OtoType,
    pub trailing_stop_activation_price: u64,
    pub trailing_stop_price: u64,
    pub trailing_stop_price_type: TrailingPriceType,
    pub trailing_watermark: u64,
    /// Stop condition already fired in the engine
    pub triggered: bool,

    // Relationships
    pub parent_order_id: Option<u64>,
    pub root_order_id: Option<u64>,
    /// Take-profit leg (upper leg for straddle/strangle)
    pub tp_order_id: Option<u64>,
    /// Stop-loss leg (lower leg for straddle/strangle)
    pub sl_order_id: Option<u64>,
    pub tp_status: Option<OrderStatus>,
    pub sl_status: Option<OrderStatus>,
    pub tp_filled_amount: u64,
    pub sl_filled_amount: u64,

    pub ui: Option<String>,
    pub is_replace: bool,
    /// Residual of the order this one replaced
    pub previous_locked_funds: u64,
    /// Base locked for the sell leg of a straddle/strangle
    pub previous_opposite_locked_funds: u64,
}

impl Order {
    pub fn new(
        id: u64,
        owner: AccountKey,
        market_id: impl Into<String>,
        side: Side,
        order_type: OrderType,
        now: i64,
    ) -> Self {
        Self {
            id,
            client_order_id: None,
            owner_id: owner.user_id,
            sub_account: owner.sub_account,
            market_id: market_id.into(),
            side,
            order_type,
            stop: StopKind::None,
            price: 0,
            amount: 0,
            stop_price: 0,
            opposite_stop_price: 0,
            locked_funds: 0,
            used_funds: 0,
            opposite_used_funds: 0,
            filled_amount: 0,
            filled_quote: 0,
            fee_amount: 0,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            tp_price: 0,
            sl_price: 0,
            tp_rel: 0,
            sl_rel: 0,
            oto_type: OtoType::Limit,
            trailing_stop_activation_price: 0,
            trailing_stop_price: 0,
            trailing_stop_price_type: TrailingPriceType::Absolute,
            trailing_watermark: 0,
            triggered: false,
            parent_order_id: None,
            root_order_id: None,
            tp_order_id: None,
            sl_order_id: None,
            tp_status: None,
            sl_status: None,
            tp_filled_amount: 0,
            sl_filled_amount: 0,
            ui: None,
            is_replace: false,
            previous_locked_funds: 0,
            previous_opposite_locked_funds: 0,
        }
    }

    pub fn owner(&self) -> AccountKey {
        AccountKey::new(self.owner_id, self.sub_account)
    }

    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.filled_amount)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_container(&self) -> bool {
        self.order_type.is_container()
    }

    /// Root of this order's tree (itself for a root)
    pub fn tree_root(&self) -> u64 {
        self.root_order_id.unwrap_or(self.id)
    }

    /// Funds not consumed by fills
    pub fn residual_funds(&self) -> u64 {
        self.locked_funds.saturating_sub(self.used_funds)
    }

    /// Leg ids of a container
    pub fn legs(&self) -> impl Iterator<Item = u64> {
        self.tp_order_id.into_iter().chain(self.sl_order_id)
    }

    /// Volume-weighted fill price, `None` before the first fill
    pub fn average_price(&self, base_precision: u32) -> Result<Option<u64>> {
        if self.filled_amount == 0 {
            return Ok(None);
        }
        let scale = decimal::pow10(base_precision)? as u128;
        let price = (self.filled_quote as u128) * scale / (self.filled_amount as u128);
        Ok(Some(u64::try_from(price).map_err(|_| {
            common::Error::overflow(format!("average price of order {}", self.id))
        })?))
    }

    /// Net amount received so far, in the coin this order receives
    pub fn received(&self) -> u64 {
        let gross = match self.side {
            Side::Buy => self.filled_amount,
            Side::Sell => self.filled_quote,
        };
        gross.saturating_sub(self.fee_amount)
    }

    /// Engine command carrying this order's current state
    ///
    /// OTO parents enter the engine as their `oto_type` primitive. An order
    /// whose stop already fired is sent without its stop condition.
    pub fn to_command(&self) -> OrderCommand {
        let order_type = match self.order_type {
            OrderType::Oto => match self.oto_type {
                OtoType::Limit => OrderType::Limit,
                OtoType::Market => OrderType::Market,
            },
            other => other,
        };

        let mut command = OrderCommand::new(
            self.id,
            self.owner_id,
            self.sub_account,
            &self.market_id,
            self.side,
            order_type,
        );
        command.stop = if self.triggered {
            StopKind::None
        } else {
            self.stop
        };
        command.amount = self.amount;
        command.price = self.price;
        command.stop_price = self.stop_price;
        command.funds = self.locked_funds;
        command.take_profit_price = self.tp_price;
        command.stop_loss_price = self.sl_price;
        command.trailing_stop_activation_price = self.trailing_stop_activation_price;
        command.trailing_stop_price = self.trailing_stop_price;
        command.trailing_stop_price_type = self.trailing_stop_price_type;
        command.trailing_watermark = self.trailing_watermark;
        command.oto_type = self.oto_type;
        command.status = self.status;
        command.filled_amount = self.filled_amount;
        command.used_funds = self.used_funds;
        command
    }
}

/// A projected trade, immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub market_id: String,
    /// Engine trade sequence, unique per market
    pub seqid: u64,
    pub price: u64,
    pub volume: u64,
    pub quote_volume: u64,
    pub taker_side: Side,
    pub maker_order_id: u64,
    pub taker_order_id: u64,
    pub maker_id: u64,
    pub maker_sub_account: u64,
    pub taker_id: u64,
    pub taker_sub_account: u64,
    pub maker_fee: u64,
    pub taker_fee: u64,
    pub created_at: i64,
}

impl TradeRecord {
    pub fn from_trade(
        id: u64,
        market_id: &str,
        trade: &Trade,
        maker_fee: u64,
        taker_fee: u64,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            market_id: market_id.to_string(),
            seqid: trade.trade_seq,
            price: trade.price,
            volume: trade.volume,
            quote_volume: trade.quote_volume,
            taker_side: trade.taker_side,
            maker_order_id: trade.maker_order_id,
            taker_order_id: trade.taker_order_id,
            maker_id: trade.maker_owner_id,
            maker_sub_account: trade.maker_sub_account,
            taker_id: trade.taker_owner_id,
            taker_sub_account: trade.taker_sub_account,
            maker_fee,
            taker_fee,
            created_at,
        }
    }

    /// Fee paid by the buyer, in base
    pub fn bid_fee_amount(&self) -> u64 {
        match self.taker_side {
            Side::Buy => self.taker_fee,
            Side::Sell => self.maker_fee,
        }
    }

    /// Fee paid by the seller, in quote
    pub fn ask_fee_amount(&self) -> u64 {
        match self.taker_side {
            Side::Buy => self.maker_fee,
            Side::Sell => self.taker_fee,
        }
    }
}

/// Open or closed, for order listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Open,
    Closed,
}

impl StatusFilter {
    pub fn matches(&self, status: OrderStatus) -> bool {
        match self {
            StatusFilter::Open => !status.is_terminal(),
            StatusFilter::Closed => status.is_terminal(),
        }
    }
}

/// Order listing query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    pub owner_id: Option<u64>,
    pub sub_account: Option<u64>,
    pub market_id: Option<String>,
    pub status: Option<StatusFilter>,
    pub side: Option<Side>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<i64>,
    /// Exclusive upper bound on `created_at`
    pub to: Option<i64>,
    pub limit: usize,
    /// Zero-based page of `limit` orders
    pub page: usize,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.owner_id.map_or(true, |id| order.owner_id == id)
            && self.sub_account.map_or(true, |sub| order.sub_account == sub)
            && self
                .market_id
                .as_deref()
                .map_or(true, |m| order.market_id == m)
            && self.status.map_or(true, |s| s.matches(order.status))
            && self.side.map_or(true, |side| order.side == side)
            && self.from.map_or(true, |from| order.created_at >= from)
            && self.to.map_or(true, |to| order.created_at < to)
    }

    /// Rows to skip and take; a zero limit means unbounded
    pub fn window(&self) -> (usize, usize) {
        if self.limit == 0 {
            (0, usize::MAX)
        } else {
            (self.page.saturating_mul(self.limit), self.limit)
        }
    }
}

/// Record published to `sync_data` after each projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub market_id: String,
    pub seq_id: u64,
    pub order_ids: Vec<u64>,
    pub trade_ids: Vec<u64>,
}

impl SyncRecord {
    pub fn max_order_id(&self) -> u64 {
        self.order_ids.iter().copied().max().unwrap_or(0)
    }

    pub fn max_trade_id(&self) -> u64 {
        self.trade_ids.iter().copied().max().unwrap_or(0)
    }
}

/// Funds an order of `amount` at `price` needs in its funds coin
pub fn claim_for(market: &Market, side: Side, price: u64, amount: u64) -> Result<u64> {
    Ok(match side {
        Side::Buy => market.quote_value(price, amount)?,
        Side::Sell => amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: Side, order_type: OrderType) -> Order {
        let mut order = Order::new(7, AccountKey::new(1, 0), "btcusdt", side, order_type, 100);
        order.amount = 10_000;
        order.price = 3_000_000;
        order
    }

    #[test]
    fn test_oto_parent_enters_engine_as_its_primitive() {
        let mut parent = order(Side::Buy, OrderType::Oto);
        parent.oto_type = OtoType::Market;
        parent.locked_funds = 3_150_000;

        let command = parent.to_command();
        assert_eq!(command.order_type, OrderType::Market);
        assert_eq!(command.funds, 3_150_000);
    }

    #[test]
    fn test_triggered_stop_is_restored_without_condition() {
        let mut stop = order(Side::Sell, OrderType::Limit);
        stop.stop = StopKind::Loss;
        stop.stop_price = 2_900_000;
        assert_eq!(stop.to_command().stop, StopKind::Loss);

        stop.triggered = true;
        assert_eq!(stop.to_command().stop, StopKind::None);
    }

    #[test]
    fn test_average_price_and_received() {
        let mut buy = order(Side::Buy, OrderType::Limit);
        assert_eq!(buy.average_price(4).unwrap(), None);

        // 0.5 at 30000 and 0.5 at 31000
        buy.filled_amount = 10_000;
        buy.filled_quote = 1_500_000 + 1_550_000;
        buy.fee_amount = 10;
        assert_eq!(buy.average_price(4).unwrap(), Some(3_050_000));
        assert_eq!(buy.received(), 9_990);
    }

    #[test]
    fn test_filter_window_and_match() {
        let filter = OrderFilter {
            owner_id: Some(1),
            status: Some(StatusFilter::Open),
            limit: 20,
            page: 2,
            ..Default::default()
        };
        assert_eq!(filter.window(), (40, 20));
        assert!(filter.matches(&order(Side::Buy, OrderType::Limit)));

        let mut closed = order(Side::Buy, OrderType::Limit);
        closed.status = OrderStatus::Filled;
        assert!(!filter.matches(&closed));
        assert_eq!(OrderFilter::default().window(), (0, usize::MAX));
    }
}
