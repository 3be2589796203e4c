//! Core matching engine implementation
//!
//! This is a deterministic, single-threaded matching engine for one market.
//! It owns the book, the dormant stop and trailing-stop orders, and the
//! market's event and trade sequence counters.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use common::decimal;
use common::{OrderStatus, OrderType, Side};

use crate::command::{CancelCommand, Command, OrderCommand};
use crate::domain::{BookOrder, OrderBook, OrderBookSnapshot, TerminatedCache};
use crate::error::MatchingError;
use crate::event::{CancelFailReason, EngineEvent, EventKind, Trade};
use crate::result::{CancelOutcome, Fill};
use crate::stops::{StopBook, TrailingBook, TrailingUpdate};
use crate::Result;

// ============================================================================
// Taker
// ============================================================================

/// Incoming order while it walks the opposite side of the book
#[derive(Debug, Clone)]
struct Taker {
    id: u64,
    owner_id: u64,
    sub_account: u64,
    side: Side,
    order_type: OrderType,
    price: u64,
    amount: u64,
    filled: u64,
    funds: u64,
    used_funds: u64,
    /// `OrderAccepted` was already emitted (activated stops)
    accepted: bool,
}

impl Taker {
    fn new(order: &OrderCommand, order_type: OrderType, accepted: bool) -> Self {
        Self {
            id: order.id,
            owner_id: order.owner_id,
            sub_account: order.sub_account,
            side: order.side,
            order_type,
            price: order.price,
            amount: order.amount,
            filled: order.filled_amount,
            funds: order.funds,
            used_funds: order.used_funds,
            accepted,
        }
    }

    fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.filled)
    }

    fn crosses(&self, maker_price: u64) -> bool {
        match (self.order_type, self.side) {
            (OrderType::Market, _) => true,
            (_, Side::Buy) => maker_price <= self.price,
            (_, Side::Sell) => maker_price >= self.price,
        }
    }

    /// Largest volume this taker can take at `price`
    fn capacity_at(&self, price: u64, base_precision: u32) -> Result<u64> {
        let remaining = self.remaining();
        if self.order_type == OrderType::Market && self.side == Side::Buy {
            let funds_left = self.funds.saturating_sub(self.used_funds);
            let affordable = decimal::base_for_quote(funds_left, price, base_precision)?;
            Ok(remaining.min(affordable))
        } else {
            Ok(remaining)
        }
    }

    fn fill(&mut self, volume: u64, quote_volume: u64) {
        self.filled += volume;
        self.used_funds += match self.side {
            Side::Buy => quote_volume,
            Side::Sell => volume,
        };
    }
}

// ============================================================================
// Market Engine
// ============================================================================

/// Matching engine for a single market
///
/// CRITICAL PROPERTIES:
/// 1. Deterministic: same commands produce same events
/// 2. Price-time priority: best price first, then FIFO within a level
/// 3. Trades execute at the maker's price
/// 4. Every emitted event gets the next `seq_id`, no gaps
/// 5. One timestamp per command, no wall-clock reads while matching
/// 6. Triggered stops activate in arrival order and may cascade
pub struct MarketEngine {
    market_id: String,
    base_precision: u32,
    book: OrderBook,
    stops: StopBook,
    trailing: TrailingBook,
    terminated: TerminatedCache,
    /// Dormant orders triggered while processing the current command
    activations: VecDeque<OrderCommand>,
    events: Vec<EngineEvent>,
    event_seq: u64,
    trade_seq: u64,
    /// Time priority across book, stops and trailing orders
    arrival_seq: u64,
    last_price: Option<u64>,
    now: i64,
}

impl MarketEngine {
    pub fn new(
        market_id: impl Into<String>,
        base_precision: u32,
        terminated_cache_size: usize,
    ) -> Self {
        let market_id = market_id.into();
        Self {
            book: OrderBook::new(market_id.clone()),
            market_id,
            base_precision,
            stops: StopBook::new(),
            trailing: TrailingBook::new(),
            terminated: TerminatedCache::new(terminated_cache_size),
            activations: VecDeque::new(),
            events: Vec::new(),
            event_seq: 0,
            trade_seq: 0,
            arrival_seq: 0,
            last_price: None,
            now: 0,
        }
    }

    /// Continue the sequences after the last recovered event and trade
    pub fn seed(&mut self, event_seq: u64, trade_seq: u64) {
        self.event_seq = self.event_seq.max(event_seq);
        self.trade_seq = self.trade_seq.max(trade_seq);
        info!(
            market = %self.market_id,
            event_seq = self.event_seq,
            trade_seq = self.trade_seq,
            "Seeded engine sequences"
        );
    }

    /// Last traded price used for stop evaluation; zero is ignored
    pub fn set_last_price(&mut self, price: u64) {
        if price > 0 {
            self.last_price = Some(price);
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn event_seq(&self) -> u64 {
        self.event_seq
    }

    pub fn trade_seq(&self) -> u64 {
        self.trade_seq
    }

    pub fn last_price(&self) -> Option<u64> {
        self.last_price
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Resting, dormant stop and trailing orders
    pub fn open_orders(&self) -> usize {
        self.book.order_count() + self.stops.len() + self.trailing.len()
    }

    pub fn snapshot(&self, depth: usize) -> OrderBookSnapshot {
        let (bids, asks) = self.book.depth(depth);
        OrderBookSnapshot {
            market_id: self.market_id.clone(),
            bids,
            asks,
            seq_id: self.event_seq,
            last_price: self.last_price,
        }
    }

    /// Process one command and return the events it produced
    ///
    /// Any error is fatal for the market: the engine state may be partially
    /// updated and must be rebuilt from storage.
    pub fn process(&mut self, command: Command, timestamp: i64) -> Result<Vec<EngineEvent>> {
        if command.market_id() != self.market_id {
            return Err(MatchingError::WrongMarket {
                expected: self.market_id.clone(),
                got: command.market_id().to_string(),
            });
        }

        self.now = timestamp;
        self.events.clear();
        self.activations.clear();

        match command {
            Command::NewOrder(order) => self.place(order)?,
            Command::CancelOrder(cancel) => {
                self.cancel(&cancel);
            }
            Command::ReplaceOrder { old_id, order } => self.replace(old_id, order)?,
        }
        self.run_activations()?;

        Ok(std::mem::take(&mut self.events))
    }

    /// Put a live order back without emitting events or matching
    ///
    /// Used by recovery. Stop orders whose `stop` is `None` were already
    /// triggered and go straight to the book.
    pub fn restore(&mut self, order: OrderCommand) -> Result<()> {
        if order.market_id != self.market_id {
            return Err(MatchingError::WrongMarket {
                expected: self.market_id.clone(),
                got: order.market_id,
            });
        }
        self.ensure_new(order.id)?;

        if !matches!(
            order.status,
            OrderStatus::Untouched | OrderStatus::PartiallyFilled
        ) {
            return Err(MatchingError::invalid_order(format!(
                "order {} cannot be restored in status {}",
                order.id, order.status
            )));
        }
        if order.remaining() == 0 {
            return Err(MatchingError::invalid_order(format!(
                "order {} has nothing left to restore",
                order.id
            )));
        }

        let sequence = self.next_arrival();
        match order.order_type {
            OrderType::TrailingStop => self.trailing.insert(order, sequence),
            OrderType::Limit | OrderType::Market if order.is_stop() => {
                self.stops.insert(order, sequence)
            }
            OrderType::Limit if order.price > 0 => {
                self.book.insert(BookOrder::from_command(&order, sequence))
            }
            other => {
                return Err(MatchingError::invalid_order(format!(
                    "order {} of type {} cannot rest in the book",
                    order.id, other
                )))
            }
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn place(&mut self, order: OrderCommand) -> Result<()> {
        self.ensure_new(order.id)?;
        Self::validate(&order)?;

        debug!(
            market = %self.market_id,
            order_id = order.id,
            side = %order.side,
            order_type = %order.order_type,
            price = order.price,
            amount = order.amount,
            "New order"
        );

        match order.order_type {
            OrderType::TrailingStop => {
                self.emit_accepted(order.id, order.owner_id, order.sub_account, order.side);
                let sequence = self.next_arrival();
                self.trailing.insert(order, sequence);
                if let Some(last) = self.last_price {
                    self.observe_trailing(last);
                }
            }
            _ if order.is_stop() => {
                self.emit_accepted(order.id, order.owner_id, order.sub_account, order.side);
                match self.last_price {
                    Some(last) if order.stop.is_triggered(order.side, order.stop_price, last) => {
                        self.activations.push_back(order)
                    }
                    _ => {
                        let sequence = self.next_arrival();
                        self.stops.insert(order, sequence);
                    }
                }
            }
            _ => self.execute(Taker::new(&order, order.order_type, false))?,
        }
        Ok(())
    }

    fn cancel(&mut self, cancel: &CancelCommand) -> CancelOutcome {
        if let Some((owner_id, sub_account, side, filled_amount, used_funds)) =
            self.take_live(cancel.id)
        {
            info!(market = %self.market_id, order_id = cancel.id, "Order cancelled");
            self.emit_status(
                cancel.id,
                owner_id,
                sub_account,
                side,
                OrderStatus::Cancelled,
                filled_amount,
                used_funds,
            );
            self.terminated.insert(cancel.id, OrderStatus::Cancelled);
            return CancelOutcome::Cancelled {
                filled_amount,
                used_funds,
            };
        }

        let reason = match self.terminated.get(cancel.id) {
            Some(OrderStatus::Filled) => CancelFailReason::AlreadyFilled,
            Some(_) => CancelFailReason::AlreadyCancelled,
            None => CancelFailReason::NotFound,
        };
        debug!(market = %self.market_id, order_id = cancel.id, %reason, "Cancel refused");
        self.emit(EventKind::OrderCancelFailed {
            order_id: cancel.id,
            owner_id: cancel.owner_id,
            sub_account: cancel.sub_account,
            reason,
        });
        CancelOutcome::Failed(reason)
    }

    fn replace(&mut self, old_id: u64, order: OrderCommand) -> Result<()> {
        self.ensure_new(order.id)?;
        Self::validate(&order)?;

        let cancel = CancelCommand {
            id: old_id,
            market_id: order.market_id.clone(),
            owner_id: order.owner_id,
            sub_account: order.sub_account,
        };
        match self.cancel(&cancel) {
            CancelOutcome::Cancelled { .. } => self.place(order),
            CancelOutcome::Failed(reason) => {
                warn!(
                    market = %self.market_id,
                    old_id,
                    new_id = order.id,
                    %reason,
                    "Replace rejected, new order cancelled"
                );
                self.emit_status(
                    order.id,
                    order.owner_id,
                    order.sub_account,
                    order.side,
                    OrderStatus::Cancelled,
                    0,
                    0,
                );
                self.terminated.insert(order.id, OrderStatus::Cancelled);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Matching
    // ========================================================================

    fn execute(&mut self, mut taker: Taker) -> Result<()> {
        while let Some(fill) = self.next_fill(&mut taker)? {
            self.record_fill(&taker, fill);
        }
        self.finish_taker(taker);
        Ok(())
    }

    /// Match the taker against the head of the best opposite level
    fn next_fill(&mut self, taker: &mut Taker) -> Result<Option<Fill>> {
        if taker.remaining() == 0 {
            return Ok(None);
        }
        let maker_side = taker.side.opposite();
        let Some(price) = self.book.best_price(maker_side) else {
            return Ok(None);
        };
        if !taker.crosses(price) {
            return Ok(None);
        }
        let capacity = taker.capacity_at(price, self.base_precision)?;
        if capacity == 0 {
            return Ok(None);
        }
        let Some(mut maker) = self.book.pop_best(maker_side) else {
            return Ok(None);
        };

        let volume = capacity.min(maker.remaining());
        let quote_volume = decimal::quote_amount(price, volume, self.base_precision)?;

        maker.fill(volume, quote_volume);
        taker.fill(volume, quote_volume);

        if !maker.is_filled() {
            // Partially consumed maker keeps its place
            self.book.push_front(maker.clone());
        }

        Ok(Some(Fill {
            maker,
            price,
            volume,
            quote_volume,
        }))
    }

    fn record_fill(&mut self, taker: &Taker, fill: Fill) {
        self.trade_seq += 1;
        let maker = &fill.maker;

        debug!(
            market = %self.market_id,
            trade_seq = self.trade_seq,
            maker = maker.id,
            taker = taker.id,
            price = fill.price,
            volume = fill.volume,
            "Trade"
        );

        self.emit(EventKind::NewTrade(Trade {
            trade_seq: self.trade_seq,
            taker_side: taker.side,
            maker_order_id: maker.id,
            maker_owner_id: maker.owner_id,
            maker_sub_account: maker.sub_account,
            taker_order_id: taker.id,
            taker_owner_id: taker.owner_id,
            taker_sub_account: taker.sub_account,
            price: fill.price,
            volume: fill.volume,
            quote_volume: fill.quote_volume,
        }));
        self.emit_status(
            maker.id,
            maker.owner_id,
            maker.sub_account,
            maker.side,
            maker.status(),
            maker.filled,
            maker.used_funds,
        );
        if fill.maker_done() {
            self.terminated.insert(maker.id, OrderStatus::Filled);
        }

        self.last_price = Some(fill.price);
        self.observe(fill.price);
    }

    fn finish_taker(&mut self, taker: Taker) {
        if taker.remaining() == 0 {
            self.emit_status(
                taker.id,
                taker.owner_id,
                taker.sub_account,
                taker.side,
                OrderStatus::Filled,
                taker.filled,
                taker.used_funds,
            );
            self.terminated.insert(taker.id, OrderStatus::Filled);
        } else if taker.order_type == OrderType::Limit {
            if taker.filled > 0 {
                self.emit_status(
                    taker.id,
                    taker.owner_id,
                    taker.sub_account,
                    taker.side,
                    OrderStatus::PartiallyFilled,
                    taker.filled,
                    taker.used_funds,
                );
            } else if !taker.accepted {
                self.emit_accepted(taker.id, taker.owner_id, taker.sub_account, taker.side);
            }
            let sequence = self.next_arrival();
            self.book.insert(BookOrder {
                id: taker.id,
                owner_id: taker.owner_id,
                sub_account: taker.sub_account,
                side: taker.side,
                order_type: taker.order_type,
                price: taker.price,
                amount: taker.amount,
                filled: taker.filled,
                funds: taker.funds,
                used_funds: taker.used_funds,
                sequence,
            });
        } else {
            // Market leftovers never rest
            self.emit_status(
                taker.id,
                taker.owner_id,
                taker.sub_account,
                taker.side,
                OrderStatus::Cancelled,
                taker.filled,
                taker.used_funds,
            );
            self.terminated.insert(taker.id, OrderStatus::Cancelled);
        }
    }

    // ========================================================================
    // Stops
    // ========================================================================

    fn observe(&mut self, last_price: u64) {
        let triggered = self.stops.take_triggered(last_price);
        self.activations.extend(triggered);
        self.observe_trailing(last_price);
    }

    fn observe_trailing(&mut self, last_price: u64) {
        for update in self.trailing.observe(last_price) {
            match update {
                TrailingUpdate::Moved {
                    order_id,
                    owner_id,
                    sub_account,
                    watermark,
                    trigger_price,
                } => self.emit(EventKind::TrailingPriceUpdated {
                    order_id,
                    owner_id,
                    sub_account,
                    watermark,
                    trigger_price,
                }),
                TrailingUpdate::Triggered(order) => self.activations.push_back(order),
            }
        }
    }

    fn run_activations(&mut self) -> Result<()> {
        while let Some(order) = self.activations.pop_front() {
            let order_type = match order.order_type {
                OrderType::TrailingStop => OrderType::Market,
                other => other,
            };
            info!(
                market = %self.market_id,
                order_id = order.id,
                stop_price = order.stop_price,
                last_price = ?self.last_price,
                "Stop activated"
            );
            self.emit(EventKind::StopActivated {
                order_id: order.id,
                owner_id: order.owner_id,
                sub_account: order.sub_account,
                side: order.side,
                order_type,
                stop_price: order.stop_price,
            });
            self.execute(Taker::new(&order, order_type, true))?;
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn validate(order: &OrderCommand) -> Result<()> {
        let reject = |reason: &str| {
            Err(MatchingError::invalid_order(format!(
                "order {}: {}",
                order.id, reason
            )))
        };

        if order.amount == 0 {
            return reject("amount must be positive");
        }
        if order.is_stop() && order.stop_price == 0 {
            return reject("stop order without stop price");
        }
        match order.order_type {
            OrderType::Limit if order.price == 0 => reject("limit order without price"),
            OrderType::Market | OrderType::TrailingStop
                if order.side == Side::Buy && order.funds == 0 =>
            {
                reject("market buy without funds")
            }
            OrderType::TrailingStop if order.trailing_stop_price == 0 => {
                reject("trailing stop without offset")
            }
            OrderType::Limit | OrderType::Market | OrderType::TrailingStop => Ok(()),
            other => reject(&format!("{} orders are not executed by the engine", other)),
        }
    }

    fn ensure_new(&self, id: u64) -> Result<()> {
        if self.book.contains(id)
            || self.stops.contains(id)
            || self.trailing.contains(id)
            || self.terminated.get(id).is_some()
        {
            return Err(MatchingError::DuplicateOrder(id));
        }
        Ok(())
    }

    /// Remove a live order wherever it lives; (owner, sub, side, filled, used)
    fn take_live(&mut self, id: u64) -> Option<(u64, u64, Side, u64, u64)> {
        if let Some(order) = self.book.remove(id) {
            return Some((
                order.owner_id,
                order.sub_account,
                order.side,
                order.filled,
                order.used_funds,
            ));
        }
        self.stops
            .remove(id)
            .or_else(|| self.trailing.remove(id))
            .map(|order| {
                (
                    order.owner_id,
                    order.sub_account,
                    order.side,
                    order.filled_amount,
                    order.used_funds,
                )
            })
    }

    fn next_arrival(&mut self) -> u64 {
        self.arrival_seq += 1;
        self.arrival_seq
    }

    fn emit(&mut self, kind: EventKind) {
        self.event_seq += 1;
        self.events.push(EngineEvent {
            market_id: self.market_id.clone(),
            seq_id: self.event_seq,
            timestamp: self.now,
            kind,
        });
    }

    fn emit_accepted(&mut self, order_id: u64, owner_id: u64, sub_account: u64, side: Side) {
        self.emit(EventKind::OrderAccepted {
            order_id,
            owner_id,
            sub_account,
            side,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_status(
        &mut self,
        order_id: u64,
        owner_id: u64,
        sub_account: u64,
        side: Side,
        status: OrderStatus,
        filled_amount: u64,
        used_funds: u64,
    ) {
        self.emit(EventKind::OrderStatusChange {
            order_id,
            owner_id,
            sub_account,
            side,
            status,
            filled_amount,
            used_funds,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use common::StopKind;
    use proptest::prelude::*;

    const MARKET: &str = "btcusdt";
    const BP: u32 = 4;
    const TS: i64 = 1_700_000_000_000_000_000;

    fn engine() -> MarketEngine {
        MarketEngine::new(MARKET, BP, 1_000)
    }

    fn limit(id: u64, owner: u64, side: Side, price: u64, amount: u64) -> OrderCommand {
        let mut order = OrderCommand::new(id, owner, 0, MARKET, side, OrderType::Limit);
        order.price = price;
        order.amount = amount;
        if side == Side::Buy {
            order.funds = decimal::quote_amount(price, amount, BP).unwrap();
        }
        order
    }

    fn market(id: u64, owner: u64, side: Side, amount: u64, funds: u64) -> OrderCommand {
        let mut order = OrderCommand::new(id, owner, 0, MARKET, side, OrderType::Market);
        order.amount = amount;
        order.funds = funds;
        order
    }

    fn stop(
        id: u64,
        side: Side,
        kind: StopKind,
        order_type: OrderType,
        stop_price: u64,
        amount: u64,
    ) -> OrderCommand {
        let mut order = OrderCommand::new(id, 1, 0, MARKET, side, order_type);
        order.stop = kind;
        order.stop_price = stop_price;
        order.amount = amount;
        order
    }

    fn cancel(id: u64) -> Command {
        Command::CancelOrder(CancelCommand {
            id,
            market_id: MARKET.to_string(),
            owner_id: 1,
            sub_account: 0,
        })
    }

    fn run(engine: &mut MarketEngine, order: OrderCommand) -> Vec<EngineEvent> {
        engine.process(Command::NewOrder(order), TS).unwrap()
    }

    /// Compact, order-preserving rendering of events for assertions
    fn describe(events: &[EngineEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match &event.kind {
                EventKind::OrderAccepted { order_id, .. } => format!("accepted {}", order_id),
                EventKind::OrderStatusChange {
                    order_id,
                    status,
                    filled_amount,
                    used_funds,
                    ..
                } => format!("{} {} {}/{}", order_id, status, filled_amount, used_funds),
                EventKind::NewTrade(t) => format!(
                    "trade {}<-{} {}@{}",
                    t.maker_order_id, t.taker_order_id, t.volume, t.price
                ),
                EventKind::StopActivated {
                    order_id,
                    order_type,
                    stop_price,
                    ..
                } => format!("activated {} {} {}", order_id, order_type, stop_price),
                EventKind::TrailingPriceUpdated {
                    order_id,
                    watermark,
                    trigger_price,
                    ..
                } => format!("trailing {} {}/{}", order_id, watermark, trigger_price),
                EventKind::OrderCancelFailed {
                    order_id, reason, ..
                } => format!("cancel_failed {} {}", order_id, reason),
            })
            .collect()
    }

    #[test]
    fn test_simple_match() {
        let mut engine = engine();

        let events = run(&mut engine, limit(1, 1, Side::Sell, 3_000_000, 10_000));
        assert_eq!(describe(&events), vec!["accepted 1"]);

        let events = run(&mut engine, limit(2, 2, Side::Buy, 3_000_000, 5_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 1<-2 5000@3000000",
                "1 partially_filled 5000/5000",
                "2 filled 5000/1500000",
            ]
        );

        let trade = events[0].trade().unwrap();
        assert_eq!(trade.quote_volume, 1_500_000);
        assert_eq!(trade.taker_side, Side::Buy);
        assert_eq!(trade.trade_seq, 1);

        // seq ids continue across commands, one timestamp per command
        let seqs: Vec<u64> = events.iter().map(|e| e.seq_id).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(events.iter().all(|e| e.timestamp == TS));

        assert_eq!(engine.last_price(), Some(3_000_000));
        assert_eq!(engine.book().quantity_at(Side::Sell, 3_000_000), 5_000);
    }

    #[test]
    fn test_price_time_priority() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_100, 10_000));
        run(&mut engine, limit(2, 1, Side::Sell, 10_100, 10_000));
        run(&mut engine, limit(3, 1, Side::Sell, 10_000, 10_000));

        let events = run(&mut engine, limit(4, 2, Side::Buy, 10_100, 15_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 3<-4 10000@10000",
                "3 filled 10000/10000",
                "trade 1<-4 5000@10100",
                "1 partially_filled 5000/5000",
                "4 filled 15000/15050",
            ]
        );
        assert_eq!(engine.book().queue_order(Side::Sell), vec![1, 2]);
    }

    #[test]
    fn test_limit_residual_rests() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_000, 4_000));

        let events = run(&mut engine, limit(2, 2, Side::Buy, 10_000, 10_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 1<-2 4000@10000",
                "1 filled 4000/4000",
                "2 partially_filled 4000/4000",
            ]
        );
        assert_eq!(engine.book().best_bid(), Some(10_000));
        assert_eq!(engine.book().quantity_at(Side::Buy, 10_000), 6_000);
    }

    #[test]
    fn test_market_leftover_is_cancelled() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Buy, 10_000, 3_000));

        let events = run(&mut engine, market(2, 2, Side::Sell, 10_000, 0));
        assert_eq!(
            describe(&events),
            vec![
                "trade 1<-2 3000@10000",
                "1 filled 3000/3000",
                "2 cancelled 3000/3000",
            ]
        );
        assert!(engine.book().is_empty());
    }

    #[test]
    fn test_market_buy_stops_when_funds_run_out() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 3_000_000, 10_000));

        // 15000.00 buys half a coin at 30000.00
        let events = run(&mut engine, market(2, 2, Side::Buy, 10_000, 1_500_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 1<-2 5000@3000000",
                "1 partially_filled 5000/5000",
                "2 cancelled 5000/1500000",
            ]
        );
    }

    #[test]
    fn test_stop_loss_activation_cascade() {
        let mut engine = engine();
        engine.set_last_price(10_000);

        run(&mut engine, limit(10, 2, Side::Buy, 9_400, 5_000));
        run(&mut engine, limit(11, 2, Side::Buy, 9_000, 20_000));

        let events = run(
            &mut engine,
            stop(3, Side::Sell, StopKind::Loss, OrderType::Market, 9_500, 10_000),
        );
        assert_eq!(describe(&events), vec!["accepted 3"]);

        // Nothing to lift: the market buy is cancelled and the price stays
        let events = run(&mut engine, market(4, 4, Side::Buy, 1_000, 1_000_000));
        assert_eq!(describe(&events), vec!["4 cancelled 0/0"]);
        assert_eq!(engine.last_price(), Some(10_000));

        let events = run(&mut engine, limit(5, 3, Side::Sell, 9_400, 1_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 10<-5 1000@9400",
                "10 partially_filled 1000/940",
                "5 filled 1000/1000",
                "activated 3 market 9500",
                "trade 10<-3 4000@9400",
                "10 filled 5000/4700",
                "trade 11<-3 6000@9000",
                "11 partially_filled 6000/5400",
                "3 filled 10000/10000",
            ]
        );
        assert_eq!(engine.last_price(), Some(9_000));
    }

    #[test]
    fn test_stop_already_triggered_on_arrival() {
        let mut engine = engine();
        engine.set_last_price(10_000);

        let mut order = stop(1, Side::Buy, StopKind::Loss, OrderType::Limit, 9_900, 1_000);
        order.price = 10_100;
        order.funds = 1_010;

        let events = run(&mut engine, order);
        assert_eq!(describe(&events), vec!["accepted 1", "activated 1 limit 9900"]);
        assert_eq!(engine.book().best_bid(), Some(10_100));
    }

    #[test]
    fn test_trailing_stop_follows_and_fires() {
        let mut engine = engine();

        let mut trailing = OrderCommand::new(20, 1, 0, MARKET, Side::Sell, OrderType::TrailingStop);
        trailing.amount = 1_000;
        trailing.trailing_stop_activation_price = 10_000;
        trailing.trailing_stop_price = 200;
        assert_eq!(describe(&run(&mut engine, trailing)), vec!["accepted 20"]);

        // Trade at 100.00 arms the order
        run(&mut engine, limit(30, 2, Side::Sell, 10_000, 1));
        let events = run(&mut engine, limit(31, 3, Side::Buy, 10_000, 1));
        assert!(describe(&events).contains(&"trailing 20 10000/9800".to_string()));

        run(&mut engine, limit(40, 4, Side::Buy, 9_000, 1_000));

        // Climb to 110.00
        run(&mut engine, limit(32, 2, Side::Sell, 11_000, 1));
        let events = run(&mut engine, limit(33, 3, Side::Buy, 11_000, 1));
        assert_eq!(
            describe(&events),
            vec![
                "trade 32<-33 1@11000",
                "32 filled 1/1",
                "trailing 20 11000/10800",
                "33 filled 1/1",
            ]
        );

        // Retrace to 108.00
        run(&mut engine, limit(34, 2, Side::Sell, 10_800, 1));
        let events = run(&mut engine, limit(35, 3, Side::Buy, 10_800, 1));
        assert_eq!(
            describe(&events),
            vec![
                "trade 34<-35 1@10800",
                "34 filled 1/1",
                "35 filled 1/1",
                "activated 20 market 10800",
                "trade 40<-20 1000@9000",
                "40 filled 1000/900",
                "20 filled 1000/1000",
            ]
        );
    }

    #[test]
    fn test_cancel_outcomes() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_000, 1_000));
        run(&mut engine, limit(2, 1, Side::Sell, 10_000, 1_000));
        run(&mut engine, limit(3, 2, Side::Buy, 10_000, 1_000));
        run(
            &mut engine,
            stop(4, Side::Sell, StopKind::Loss, OrderType::Market, 5_000, 1_000),
        );

        let events = engine.process(cancel(2), TS).unwrap();
        assert_eq!(describe(&events), vec!["2 cancelled 0/0"]);

        let events = engine.process(cancel(2), TS).unwrap();
        assert_eq!(describe(&events), vec!["cancel_failed 2 already_cancelled"]);

        let events = engine.process(cancel(1), TS).unwrap();
        assert_eq!(describe(&events), vec!["cancel_failed 1 already_filled"]);

        let events = engine.process(cancel(4), TS).unwrap();
        assert_eq!(describe(&events), vec!["4 cancelled 0/0"]);

        let events = engine.process(cancel(99), TS).unwrap();
        assert_eq!(describe(&events), vec!["cancel_failed 99 not_found"]);
        assert_eq!(engine.open_orders(), 0);
    }

    #[test]
    fn test_replace() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_000, 1_000));

        let command = Command::ReplaceOrder {
            old_id: 1,
            order: limit(2, 1, Side::Sell, 10_500, 1_000),
        };
        let events = engine.process(command, TS).unwrap();
        assert_eq!(describe(&events), vec!["1 cancelled 0/0", "accepted 2"]);
        assert_eq!(engine.book().best_ask(), Some(10_500));

        let command = Command::ReplaceOrder {
            old_id: 1,
            order: limit(3, 1, Side::Sell, 10_200, 1_000),
        };
        let events = engine.process(command, TS).unwrap();
        assert_eq!(
            describe(&events),
            vec!["cancel_failed 1 already_cancelled", "3 cancelled 0/0"]
        );
        assert_eq!(engine.book().order_count(), 1);
    }

    #[test]
    fn test_fatal_errors() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_000, 1_000));

        let err = engine
            .process(Command::NewOrder(limit(1, 1, Side::Sell, 10_000, 1_000)), TS)
            .unwrap_err();
        assert_matches!(err, MatchingError::DuplicateOrder(1));

        let err = engine
            .process(Command::NewOrder(limit(2, 1, Side::Sell, 0, 1_000)), TS)
            .unwrap_err();
        assert_matches!(err, MatchingError::InvalidOrder(_));

        let err = engine
            .process(Command::NewOrder(market(3, 1, Side::Buy, 1_000, 0)), TS)
            .unwrap_err();
        assert_matches!(err, MatchingError::InvalidOrder(_));

        let mut other = limit(4, 1, Side::Sell, 10_000, 1_000);
        other.market_id = "ethusdt".to_string();
        let err = engine.process(Command::NewOrder(other), TS).unwrap_err();
        assert_matches!(err, MatchingError::WrongMarket { .. });
    }

    #[test]
    fn test_restore_is_silent_and_keeps_fills() {
        let mut engine = engine();
        engine.seed(100, 50);

        let mut resting = limit(1, 1, Side::Sell, 10_000, 10_000);
        resting.status = OrderStatus::PartiallyFilled;
        resting.filled_amount = 4_000;
        resting.used_funds = 4_000;
        engine.restore(resting).unwrap();

        let mut dormant = stop(2, Side::Sell, StopKind::Loss, OrderType::Market, 9_000, 1_000);
        dormant.status = OrderStatus::Untouched;
        engine.restore(dormant).unwrap();

        let mut pending = limit(3, 1, Side::Sell, 10_000, 1_000);
        pending.status = OrderStatus::Pending;
        assert_matches!(engine.restore(pending), Err(MatchingError::InvalidOrder(_)));

        assert_eq!(engine.open_orders(), 2);
        assert_eq!(engine.book().quantity_at(Side::Sell, 10_000), 6_000);

        let events = run(&mut engine, limit(4, 2, Side::Buy, 10_000, 6_000));
        assert_eq!(
            describe(&events),
            vec![
                "trade 1<-4 6000@10000",
                "1 filled 10000/10000",
                "4 filled 6000/6000",
            ]
        );
        assert_eq!(events[0].seq_id, 101);
        assert_eq!(events[0].trade().unwrap().trade_seq, 51);
    }

    #[test]
    fn test_snapshot() {
        let mut engine = engine();
        run(&mut engine, limit(1, 1, Side::Sell, 10_100, 1_000));
        run(&mut engine, limit(2, 1, Side::Buy, 9_900, 2_000));

        let snapshot = engine.snapshot(10);
        assert_eq!(snapshot.market_id, MARKET);
        assert_eq!(snapshot.seq_id, 2);
        assert_eq!(snapshot.bids[0].price, 9_900);
        assert_eq!(snapshot.bids[0].amount, 2_000);
        assert_eq!(snapshot.asks[0].price, 10_100);
        assert_eq!(snapshot.last_price, None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Limit { buy: bool, price: u64, amount: u64 },
        Market { buy: bool, amount: u64 },
        Cancel { target: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (any::<bool>(), 95u64..105, 1u64..50)
                .prop_map(|(buy, price, amount)| Op::Limit { buy, price, amount }),
            1 => (any::<bool>(), 1u64..80).prop_map(|(buy, amount)| Op::Market { buy, amount }),
            1 => any::<usize>().prop_map(|target| Op::Cancel { target }),
        ]
    }

    fn commands(ops: &[Op]) -> Vec<Command> {
        ops.iter()
            .enumerate()
            .map(|(i, op)| {
                let id = i as u64 + 1;
                let side = |buy: bool| if buy { Side::Buy } else { Side::Sell };
                match op {
                    Op::Limit { buy, price, amount } => {
                        let mut order =
                            OrderCommand::new(id, id, 0, MARKET, side(*buy), OrderType::Limit);
                        order.price = *price;
                        order.amount = *amount;
                        order.funds = price * amount;
                        Command::NewOrder(order)
                    }
                    Op::Market { buy, amount } => {
                        let mut order =
                            OrderCommand::new(id, id, 0, MARKET, side(*buy), OrderType::Market);
                        order.amount = *amount;
                        order.funds = 105 * amount;
                        Command::NewOrder(order)
                    }
                    Op::Cancel { target } => cancel(*target as u64 % id + 1),
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_engine_invariants(ops in prop::collection::vec(op(), 1..80)) {
            let commands = commands(&ops);
            let mut engine = MarketEngine::new(MARKET, 0, 10_000);
            let mut all = Vec::new();

            for command in commands.iter().cloned() {
                all.extend(engine.process(command, TS).unwrap());
                if let (Some(bid), Some(ask)) = (engine.book().best_bid(), engine.book().best_ask()) {
                    prop_assert!(bid < ask, "crossed book {} >= {}", bid, ask);
                }
            }

            // Gap-free event sequence
            for (i, event) in all.iter().enumerate() {
                prop_assert_eq!(event.seq_id, i as u64 + 1);
            }

            // Strictly increasing trade sequence
            let trade_seqs: Vec<u64> = all.iter().filter_map(|e| e.trade()).map(|t| t.trade_seq).collect();
            prop_assert!(trade_seqs.windows(2).all(|w| w[0] < w[1]));

            // No order both filled and cancelled
            let mut terminal = std::collections::HashMap::new();
            for event in &all {
                if let (Some(id), Some(status)) = (event.order_id(), event.terminal_status()) {
                    let previous = terminal.insert(id, status);
                    prop_assert!(previous.is_none(), "order {} terminated twice", id);
                }
            }

            // Same history, same events
            let mut replay = MarketEngine::new(MARKET, 0, 10_000);
            let mut again = Vec::new();
            for command in commands {
                again.extend(replay.process(command, TS).unwrap());
            }
            prop_assert_eq!(all, again);
        }
    }
}
