//! Dormant orders: price-triggered stops and trailing stops
//!
//! Both books are keyed by arrival sequence where it matters, so orders
//! that trigger on the same trade activate in the order they arrived.

use std::collections::{BTreeMap, HashMap};

use common::Side;

use crate::command::OrderCommand;

// ============================================================================
// Stop Book
// ============================================================================

/// Stop-loss and stop-entry orders waiting for their trigger price
///
/// Orders that fire on a falling price (sell-loss, buy-entry) and orders
/// that fire on a rising price (sell-entry, buy-loss) are kept apart, each
/// keyed by `(stop_price, sequence)`, so a price move only scans the
/// entries it actually crosses.
#[derive(Debug, Clone, Default)]
pub struct StopBook {
    falling: BTreeMap<(u64, u64), OrderCommand>,
    rising: BTreeMap<(u64, u64), OrderCommand>,
    index: HashMap<u64, StopKey>,
}

#[derive(Debug, Clone, Copy)]
struct StopKey {
    falling: bool,
    stop_price: u64,
    sequence: u64,
}

impl StopBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: OrderCommand, sequence: u64) {
        let key = StopKey {
            falling: order.stop.fires_on_fall(order.side),
            stop_price: order.stop_price,
            sequence,
        };
        self.index.insert(order.id, key);
        let map = if key.falling {
            &mut self.falling
        } else {
            &mut self.rising
        };
        map.insert((key.stop_price, sequence), order);
    }

    pub fn remove(&mut self, id: u64) -> Option<OrderCommand> {
        let key = self.index.remove(&id)?;
        let map = if key.falling {
            &mut self.falling
        } else {
            &mut self.rising
        };
        map.remove(&(key.stop_price, key.sequence))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Remove and return every stop triggered at `last_price`, oldest first
    pub fn take_triggered(&mut self, last_price: u64) -> Vec<OrderCommand> {
        let mut keys: Vec<(bool, (u64, u64))> = self
            .falling
            .range((last_price, 0)..)
            .map(|(k, _)| (true, *k))
            .chain(
                self.rising
                    .range(..=(last_price, u64::MAX))
                    .map(|(k, _)| (false, *k)),
            )
            .collect();
        keys.sort_by_key(|(_, (_, sequence))| *sequence);

        let mut triggered = Vec::with_capacity(keys.len());
        for (falling, key) in keys {
            let map = if falling {
                &mut self.falling
            } else {
                &mut self.rising
            };
            if let Some(order) = map.remove(&key) {
                self.index.remove(&order.id);
                triggered.push(order);
            }
        }
        triggered
    }
}

// ============================================================================
// Trailing Book
// ============================================================================

#[derive(Debug, Clone)]
struct TrailingEntry {
    order: OrderCommand,
    armed: bool,
    watermark: u64,
}

impl TrailingEntry {
    fn trigger_price(&self) -> u64 {
        let offset = self
            .order
            .trailing_stop_price_type
            .offset(self.watermark, self.order.trailing_stop_price);
        match self.order.side {
            Side::Sell => self.watermark.saturating_sub(offset),
            Side::Buy => self.watermark.saturating_add(offset),
        }
    }

    fn reaches_activation(&self, last_price: u64) -> bool {
        let activation = self.order.trailing_stop_activation_price;
        activation == 0
            || match self.order.side {
                Side::Sell => last_price >= activation,
                Side::Buy => last_price <= activation,
            }
    }

    /// Move the watermark in the favourable direction; true if it moved
    fn follow(&mut self, last_price: u64) -> bool {
        let better = match self.order.side {
            Side::Sell => last_price > self.watermark,
            Side::Buy => last_price < self.watermark,
        };
        if better {
            self.watermark = last_price;
        }
        better
    }

    fn is_triggered(&self, last_price: u64) -> bool {
        match self.order.side {
            Side::Sell => last_price <= self.trigger_price(),
            Side::Buy => last_price >= self.trigger_price(),
        }
    }
}

/// Outcome of showing a trade price to the trailing book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrailingUpdate {
    Moved {
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        watermark: u64,
        trigger_price: u64,
    },
    /// Order left the book; `stop_price` holds the trigger it crossed
    Triggered(OrderCommand),
}

/// Trailing-stop orders in arrival order
///
/// A sell trails the running maximum and fires when the price falls
/// `offset` below it; a buy trails the running minimum and fires when the
/// price rises `offset` above it. Orders with an activation price only
/// start trailing once the price reaches it.
#[derive(Debug, Clone, Default)]
pub struct TrailingBook {
    entries: BTreeMap<u64, TrailingEntry>,
    index: HashMap<u64, u64>,
}

impl TrailingBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `order`; a non-zero `trailing_watermark` restores an armed order
    pub fn insert(&mut self, order: OrderCommand, sequence: u64) {
        let watermark = order.trailing_watermark;
        self.index.insert(order.id, sequence);
        self.entries.insert(
            sequence,
            TrailingEntry {
                order,
                armed: watermark > 0,
                watermark,
            },
        );
    }

    pub fn remove(&mut self, id: u64) -> Option<OrderCommand> {
        let sequence = self.index.remove(&id)?;
        self.entries.remove(&sequence).map(|entry| entry.order)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current (watermark, trigger) of an armed order
    pub fn watermark(&self, id: u64) -> Option<(u64, u64)> {
        let entry = self.entries.get(self.index.get(&id)?)?;
        entry
            .armed
            .then(|| (entry.watermark, entry.trigger_price()))
    }

    pub fn observe(&mut self, last_price: u64) -> Vec<TrailingUpdate> {
        let mut updates = Vec::new();
        let mut fired = Vec::new();

        for (sequence, entry) in self.entries.iter_mut() {
            let moved = if entry.armed {
                entry.follow(last_price)
            } else if entry.reaches_activation(last_price) {
                entry.armed = true;
                entry.watermark = last_price;
                true
            } else {
                false
            };

            if moved {
                updates.push(TrailingUpdate::Moved {
                    order_id: entry.order.id,
                    owner_id: entry.order.owner_id,
                    sub_account: entry.order.sub_account,
                    watermark: entry.watermark,
                    trigger_price: entry.trigger_price(),
                });
            }
            if entry.armed && entry.is_triggered(last_price) {
                fired.push(*sequence);
            }
        }

        for sequence in fired {
            if let Some(mut entry) = self.entries.remove(&sequence) {
                self.index.remove(&entry.order.id);
                entry.order.stop_price = entry.trigger_price();
                entry.order.trailing_watermark = entry.watermark;
                updates.push(TrailingUpdate::Triggered(entry.order));
            }
        }
        updates
    }
}
