//! Event types for the matching engine
//!
//! Events are appended to `events.<market>` and are the only way engine
//! state becomes visible to the rest of the system. Every event carries the
//! market's monotonic `seq_id` so projection can detect gaps and replays.

use serde::{Deserialize, Serialize};

use common::{OrderStatus, OrderType, Side};

use crate::Result;

/// Event emitted by a market engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub market_id: String,
    /// Monotonic per market, no gaps
    pub seq_id: u64,
    /// Nanoseconds, read once per command
    pub timestamp: i64,
    pub kind: EventKind,
}

/// Why a cancel request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelFailReason {
    AlreadyFilled,
    AlreadyCancelled,
    NotFound,
}

impl std::fmt::Display for CancelFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelFailReason::AlreadyFilled => write!(f, "already_filled"),
            CancelFailReason::AlreadyCancelled => write!(f, "already_cancelled"),
            CancelFailReason::NotFound => write!(f, "not_found"),
        }
    }
}

/// A matched execution between a resting maker and an incoming taker
///
/// Price is always the maker's price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Monotonic per market
    pub trade_seq: u64,
    pub taker_side: Side,
    pub maker_order_id: u64,
    pub maker_owner_id: u64,
    pub maker_sub_account: u64,
    pub taker_order_id: u64,
    pub taker_owner_id: u64,
    pub taker_sub_account: u64,
    pub price: u64,
    /// Base volume
    pub volume: u64,
    /// `price * volume` in quote units
    pub quote_volume: u64,
}

impl Trade {
    /// Order id on the buy side of the trade
    pub fn buy_order_id(&self) -> u64 {
        match self.taker_side {
            Side::Buy => self.taker_order_id,
            Side::Sell => self.maker_order_id,
        }
    }

    /// Order id on the sell side of the trade
    pub fn sell_order_id(&self) -> u64 {
        match self.taker_side {
            Side::Buy => self.maker_order_id,
            Side::Sell => self.taker_order_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Order is live in the engine (resting, dormant stop or trailing)
    OrderAccepted {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        side: Side,
    },
    OrderStatusChange {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        side: Side,
        status: OrderStatus,
        filled_amount: u64,
        used_funds: u64,
    },
    NewTrade(Trade),
    /// Dormant order turned into a live `order_type` order
    StopActivated {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        side: Side,
        order_type: OrderType,
        stop_price: u64,
    },
    TrailingPriceUpdated {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        watermark: u64,
        trigger_price: u64,
    },
    OrderCancelFailed {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        reason: CancelFailReason,
    },
}

impl EngineEvent {
    /// Id of the order this event is about; `None` for trades
    pub fn order_id(&self) -> Option<u64> {
        match &self.kind {
            EventKind::OrderAccepted { order_id, .. }
            | EventKind::OrderStatusChange { order_id, .. }
            | EventKind::StopActivated { order_id, .. }
            | EventKind::TrailingPriceUpdated { order_id, .. }
            | EventKind::OrderCancelFailed { order_id, .. } => Some(*order_id),
            EventKind::NewTrade(_) => None,
        }
    }

    pub fn trade(&self) -> Option<&Trade> {
        match &self.kind {
            EventKind::NewTrade(trade) => Some(trade),
            _ => None,
        }
    }

    /// Terminal status carried by this event, if any
    pub fn terminal_status(&self) -> Option<OrderStatus> {
        match &self.kind {
            EventKind::OrderStatusChange { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            EventKind::OrderAccepted { .. } => "order_accepted",
            EventKind::OrderStatusChange { .. } => "order_status_change",
            EventKind::NewTrade(_) => "new_trade",
            EventKind::StopActivated { .. } => "stop_activated",
            EventKind::TrailingPriceUpdated { .. } => "trailing_price_updated",
            EventKind::OrderCancelFailed { .. } => "order_cancel_failed",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(taker_side: Side) -> Trade {
        Trade {
            trade_seq: 1,
            taker_side,
            maker_order_id: 10,
            maker_owner_id: 1,
            maker_sub_account: 0,
            taker_order_id: 11,
            taker_owner_id: 2,
            taker_sub_account: 0,
            price: 3_000_000,
            volume: 5_000,
            quote_volume: 1_500_000,
        }
    }

    #[test]
    fn test_trade_sides() {
        let t = trade(Side::Buy);
        assert_eq!(t.buy_order_id(), 11);
        assert_eq!(t.sell_order_id(), 10);

        let t = trade(Side::Sell);
        assert_eq!(t.buy_order_id(), 10);
        assert_eq!(t.sell_order_id(), 11);
    }

    #[test]
    fn test_event_accessors_and_codec() {
        let event = EngineEvent {
            market_id: "btcusdt".to_string(),
            seq_id: 7,
            timestamp: 1_700_000_000_000_000_000,
            kind: EventKind::OrderStatusChange {
                order_id: 3,
                owner_id: 1,
                sub_account: 0,
                side: Side::Sell,
                status: OrderStatus::Cancelled,
                filled_amount: 0,
                used_funds: 0,
            },
        };

        assert_eq!(event.order_id(), Some(3));
        assert_eq!(event.terminal_status(), Some(OrderStatus::Cancelled));
        assert!(event.trade().is_none());
        assert_eq!(EngineEvent::decode(&event.encode().unwrap()).unwrap(), event);

        let trade_event = EngineEvent {
            kind: EventKind::NewTrade(trade(Side::Buy)),
            ..event
        };
        assert_eq!(trade_event.order_id(), None);
        assert_eq!(trade_event.name(), "new_trade");
    }
}
