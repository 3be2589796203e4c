//! Domain types for the matching engine
//!
//! Prices and amounts are scaled integers (see `common::decimal`), so the
//! book can key price levels directly on `u64`.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use common::{OrderStatus, OrderType, Side};

use crate::command::OrderCommand;

// ============================================================================
// Book Order
// ============================================================================

/// An order resting in the book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookOrder {
    pub id: u64,
    pub owner_id: u64,
    pub sub_account: u64,
    pub side: Side,
    pub order_type: OrderType,
    pub price: u64,
    /// Original amount
    pub amount: u64,
    /// Base filled so far
    pub filled: u64,
    pub funds: u64,
    /// Quote spent (buy) or base delivered (sell)
    pub used_funds: u64,
    /// Arrival sequence for time priority
    pub sequence: u64,
}

impl BookOrder {
    pub fn from_command(command: &OrderCommand, sequence: u64) -> Self {
        Self {
            id: command.id,
            owner_id: command.owner_id,
            sub_account: command.sub_account,
            side: command.side,
            order_type: command.order_type,
            price: command.price,
            amount: command.amount,
            filled: command.filled_amount,
            funds: command.funds,
            used_funds: command.used_funds,
            sequence,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.filled)
    }

    /// Apply a fill of `volume` base worth `quote_volume` quote
    pub fn fill(&mut self, volume: u64, quote_volume: u64) {
        self.filled += volume;
        self.used_funds += match self.side {
            Side::Buy => quote_volume,
            Side::Sell => volume,
        };
    }

    pub fn is_filled(&self) -> bool {
        self.filled >= self.amount
    }

    pub fn status(&self) -> OrderStatus {
        if self.is_filled() {
            OrderStatus::Filled
        } else if self.filled == 0 {
            OrderStatus::Untouched
        } else {
            OrderStatus::PartiallyFilled
        }
    }
}

// ============================================================================
// Order Book
// ============================================================================

/// Order book for one market
///
/// CRITICAL PROPERTIES:
/// 1. Bids sorted descending (highest price first)
/// 2. Asks sorted ascending (lowest price first)
/// 3. Each price level is FIFO queue
/// 4. Deterministic iteration order
/// 5. Every resting order is in the id index, and nothing else is
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub market_id: String,
    bids: BTreeMap<Reverse<u64>, VecDeque<BookOrder>>,
    asks: BTreeMap<u64, VecDeque<BookOrder>>,
    /// id -> (side, price) for O(log P) cancel
    index: HashMap<u64, (Side, u64)>,
}

impl OrderBook {
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Get best bid price (highest buy)
    pub fn best_bid(&self) -> Option<u64> {
        self.bids.keys().next().map(|k| k.0)
    }

    /// Get best ask price (lowest sell)
    pub fn best_ask(&self) -> Option<u64> {
        self.asks.keys().next().copied()
    }

    /// Best price among resting orders on `side`
    pub fn best_price(&self, side: Side) -> Option<u64> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    /// Append order to the back of its price level
    pub fn insert(&mut self, order: BookOrder) {
        self.index.insert(order.id, (order.side, order.price));
        match order.side {
            Side::Buy => self
                .bids
                .entry(Reverse(order.price))
                .or_default()
                .push_back(order),
            Side::Sell => self.asks.entry(order.price).or_default().push_back(order),
        }
    }

    /// Return a partially consumed maker to the head of its level
    pub fn push_front(&mut self, order: BookOrder) {
        self.index.insert(order.id, (order.side, order.price));
        match order.side {
            Side::Buy => self
                .bids
                .entry(Reverse(order.price))
                .or_default()
                .push_front(order),
            Side::Sell => self.asks.entry(order.price).or_default().push_front(order),
        }
    }

    /// Take the oldest order at the best price on `side`
    pub fn pop_best(&mut self, side: Side) -> Option<BookOrder> {
        let order = match side {
            Side::Buy => {
                let mut level = self.bids.first_entry()?;
                let order = level.get_mut().pop_front();
                if level.get().is_empty() {
                    level.remove();
                }
                order
            }
            Side::Sell => {
                let mut level = self.asks.first_entry()?;
                let order = level.get_mut().pop_front();
                if level.get().is_empty() {
                    level.remove();
                }
                order
            }
        }?;
        self.index.remove(&order.id);
        Some(order)
    }

    /// Remove order by id
    pub fn remove(&mut self, id: u64) -> Option<BookOrder> {
        let (side, price) = self.index.remove(&id)?;
        match side {
            Side::Buy => Self::remove_from_level(&mut self.bids, Reverse(price), id),
            Side::Sell => Self::remove_from_level(&mut self.asks, price, id),
        }
    }

    fn remove_from_level<K: Ord>(
        levels: &mut BTreeMap<K, VecDeque<BookOrder>>,
        key: K,
        id: u64,
    ) -> Option<BookOrder> {
        let queue = levels.get_mut(&key)?;
        let pos = queue.iter().position(|o| o.id == id)?;
        let order = queue.remove(pos);
        if queue.is_empty() {
            levels.remove(&key);
        }
        order
    }

    /// Check if book is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Get total number of orders in book
    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    /// Remaining amount resting at `price` on `side`
    pub fn quantity_at(&self, side: Side, price: u64) -> u64 {
        let level = match side {
            Side::Buy => self.bids.get(&Reverse(price)),
            Side::Sell => self.asks.get(&price),
        };
        level
            .map(|orders| orders.iter().map(BookOrder::remaining).sum())
            .unwrap_or(0)
    }

    /// Resting order ids on `side` in matching order
    pub fn queue_order(&self, side: Side) -> Vec<u64> {
        match side {
            Side::Buy => self.bids.values().flatten().map(|o| o.id).collect(),
            Side::Sell => self.asks.values().flatten().map(|o| o.id).collect(),
        }
    }

    fn levels<'a>(
        orders: impl Iterator<Item = (u64, &'a VecDeque<BookOrder>)>,
        depth: usize,
    ) -> Vec<PriceLevel> {
        orders
            .take(depth)
            .map(|(price, orders)| PriceLevel {
                price,
                amount: orders.iter().map(BookOrder::remaining).sum(),
                order_count: orders.len(),
            })
            .collect()
    }

    /// Top `depth` levels of each side
    pub fn depth(&self, depth: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        (
            Self::levels(self.bids.iter().map(|(k, q)| (k.0, q)), depth),
            Self::levels(self.asks.iter().map(|(k, q)| (*k, q)), depth),
        )
    }
}

// ============================================================================
// Price Level (for market data)
// ============================================================================

/// Price level for market data snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: u64,
    /// Total remaining base at this price
    pub amount: u64,
    /// Number of orders at this price
    pub order_count: usize,
}

/// Order book snapshot for market data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub market_id: String,
    /// Bid price levels (best first)
    pub bids: Vec<PriceLevel>,
    /// Ask price levels (best first)
    pub asks: Vec<PriceLevel>,
    /// Engine event sequence the snapshot reflects
    pub seq_id: u64,
    pub last_price: Option<u64>,
}

impl OrderBookSnapshot {
    pub fn empty(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            seq_id: 0,
            last_price: None,
        }
    }
}

// ============================================================================
// Terminated orders
// ============================================================================

/// Bounded memory of recently terminated order ids
///
/// Lets cancel report `AlreadyFilled` / `AlreadyCancelled` instead of
/// `NotFound`. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct TerminatedCache {
    capacity: usize,
    statuses: HashMap<u64, OrderStatus>,
    order: VecDeque<u64>,
}

impl TerminatedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            statuses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, id: u64, status: OrderStatus) {
        if self.capacity == 0 {
            return;
        }
        if self.statuses.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<OrderStatus> {
        self.statuses.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
