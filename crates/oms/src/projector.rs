//! Event projector
//!
//! Turns engine events into order rows, trade rows and funds movements.
//! Events of one market are applied strictly in `seq_id` order under that
//! market's lock.
//!
//! CRITICAL PROPERTIES:
//! - An event with `seq_id` at or below the market's watermark is a no-op
//! - An event skipping a `seq_id` is `ProjectionCorruption`
//! - Funds move before the watermark commits; FMS dedups by ledger ref, so
//!   re-projecting after a crash never applies a movement twice
//! - Memory is updated only after the store commit succeeded
//! - Terminal orders release `locked - used`; container legs release
//!   nothing themselves, their container releases once all legs are terminal

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use common::{AccountKey, Market, OrderStatus, OrderType, Side};
use fms::{FundsManager, LedgerRef, TradeSettlement};
use matching_engine::{EngineEvent, EventKind, Trade};
use storage::{topics, SharedLog};

use crate::error::OmsError;
use crate::fees::FeeSchedule;
use crate::manager::OrderManager;
use crate::sequencer::Sequencer;
use crate::store::{OrderStore, ProjectionBatch};
use crate::types::{claim_for, Order, SyncRecord, TradeRecord};
use crate::Result;

/// One order before and after a projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderChange {
    pub before: Order,
    pub after: Order,
}

impl OrderChange {
    pub fn became_terminal(&self) -> bool {
        !self.before.is_terminal() && self.after.is_terminal()
    }

    /// Amount filled by this projection
    pub fn new_fill(&self) -> u64 {
        self.after
            .filled_amount
            .saturating_sub(self.before.filled_amount)
    }

    pub fn became_triggered(&self) -> bool {
        !self.before.triggered && self.after.triggered
    }
}

/// Outcome of projecting one event
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub market_id: String,
    /// Zero for synthetic events
    pub seq_id: u64,
    /// Already applied earlier; nothing changed
    pub duplicate: bool,
    pub changes: Vec<OrderChange>,
    pub trades: Vec<TradeRecord>,
}

impl Projection {
    pub fn change(&self, order_id: u64) -> Option<&OrderChange> {
        self.changes.iter().find(|c| c.after.id == order_id)
    }
}

enum FundsOp {
    Unlock {
        owner: AccountKey,
        coin: String,
        amount: u64,
        order_id: u64,
    },
    Settle {
        trade_seq: u64,
        maker_order_id: u64,
        taker_order_id: u64,
        buyer: AccountKey,
        seller: AccountKey,
        volume: u64,
        quote_volume: u64,
        buyer_fee: u64,
        seller_fee: u64,
    },
}

struct Touched {
    before: Order,
    after: Order,
}

/// Orders and side effects staged for one event
struct Working<'a> {
    market: &'a Market,
    orders: &'a OrderManager,
    store: &'a dyn OrderStore,
    touched: BTreeMap<u64, Touched>,
    funds: Vec<FundsOp>,
    trades: Vec<TradeRecord>,
}

impl<'a> Working<'a> {
    fn new(market: &'a Market, orders: &'a OrderManager, store: &'a dyn OrderStore) -> Self {
        Self {
            market,
            orders,
            store,
            touched: BTreeMap::new(),
            funds: Vec::new(),
            trades: Vec::new(),
        }
    }

    async fn load(&mut self, order_id: u64) -> Result<&mut Order> {
        if !self.touched.contains_key(&order_id) {
            let order = match self.orders.get(&self.market.id, order_id) {
                Some(order) => order,
                None => self
                    .store
                    .get_order(order_id)
                    .await?
                    .ok_or(OmsError::NotFound(order_id))?,
            };
            if order.market_id != self.market.id {
                return Err(OmsError::Internal(format!(
                    "order {} belongs to {}, not {}",
                    order_id, order.market_id, self.market.id
                )));
            }
            self.touched.insert(
                order_id,
                Touched {
                    before: order.clone(),
                    after: order,
                },
            );
        }
        self.touched
            .get_mut(&order_id)
            .map(|t| &mut t.after)
            .ok_or(OmsError::NotFound(order_id))
    }

    /// Container holding this order's funds, if it is a leg
    async fn container_of(&mut self, order_id: u64) -> Result<Option<u64>> {
        let Some(parent_id) = self.load(order_id).await?.parent_order_id else {
            return Ok(None);
        };
        let is_container = self.load(parent_id).await?.is_container();
        Ok(is_container.then_some(parent_id))
    }

    fn unlock(&mut self, owner: AccountKey, side: Side, amount: u64, order_id: u64) {
        if amount == 0 {
            return;
        }
        self.funds.push(FundsOp::Unlock {
            owner,
            coin: self.market.funds_coin(side).to_string(),
            amount,
            order_id,
        });
    }

    fn into_changes(self) -> (Vec<OrderChange>, Vec<FundsOp>, Vec<TradeRecord>) {
        let changes = self
            .touched
            .into_values()
            .filter(|t| t.before != t.after)
            .map(|t| OrderChange {
                before: t.before,
                after: t.after,
            })
            .collect();
        (changes, self.funds, self.trades)
    }
}

pub struct Projector {
    orders: Arc<OrderManager>,
    store: Arc<dyn OrderStore>,
    funds: Arc<FundsManager>,
    sequencer: Arc<Sequencer>,
    fees: FeeSchedule,
    markets: HashMap<String, Market>,
    log: SharedLog,
    /// Per-market lock guarding the cached watermark (`None` until loaded)
    watermarks: Mutex<HashMap<String, Arc<AsyncMutex<Option<u64>>>>>,
}

impl Projector {
    pub fn new(
        orders: Arc<OrderManager>,
        store: Arc<dyn OrderStore>,
        funds: Arc<FundsManager>,
        sequencer: Arc<Sequencer>,
        fees: FeeSchedule,
        markets: Vec<Market>,
        log: SharedLog,
    ) -> Self {
        Self {
            orders,
            store,
            funds,
            sequencer,
            fees,
            markets: markets.into_iter().map(|m| (m.id.clone(), m)).collect(),
            log,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    pub fn market(&self, market_id: &str) -> Result<&Market> {
        self.markets
            .get(market_id)
            .ok_or_else(|| OmsError::UnknownMarket(market_id.to_string()))
    }

    fn market_lock(&self, market_id: &str) -> Arc<AsyncMutex<Option<u64>>> {
        self.watermarks
            .lock()
            .entry(market_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the cached watermark so the next event reloads it from the store
    pub async fn reset_watermark(&self, market_id: &str) {
        *self.market_lock(market_id).lock().await = None;
    }

    /// Project one engine event
    pub async fn project(&self, event: &EngineEvent) -> Result<Projection> {
        let market = self.market(&event.market_id)?;
        let lock = self.market_lock(&market.id);
        let mut watermark = lock.lock().await;

        let applied = match *watermark {
            Some(applied) => applied,
            None => {
                let applied = self.store.applied_seq(&market.id).await?;
                *watermark = Some(applied);
                applied
            }
        };

        if event.seq_id <= applied {
            debug!(market = %market.id, seq_id = event.seq_id, applied, "Skipping applied event");
            return Ok(Projection {
                market_id: market.id.clone(),
                seq_id: event.seq_id,
                duplicate: true,
                ..Default::default()
            });
        }
        if event.seq_id != applied + 1 {
            return Err(OmsError::ProjectionCorruption {
                market: market.id.clone(),
                expected: applied + 1,
                got: event.seq_id,
            });
        }

        let mut w = Working::new(market, &self.orders, self.store.as_ref());
        self.apply_event(&mut w, event).await?;
        let projection = self.commit(w, Some(event.seq_id)).await?;
        *watermark = Some(event.seq_id);

        debug!(
            market = %market.id,
            seq_id = event.seq_id,
            event = event.name(),
            orders = projection.changes.len(),
            "Event projected"
        );
        Ok(projection)
    }

    /// Cancel an order locally without an engine event
    ///
    /// Used when the engine never confirmed a cancellation. No-op for
    /// orders that are already terminal.
    pub async fn apply_synthetic_cancel(
        &self,
        market_id: &str,
        order_id: u64,
        ts: i64,
    ) -> Result<Projection> {
        let market = self.market(market_id)?;
        let lock = self.market_lock(&market.id);
        let _guard = lock.lock().await;

        let mut w = Working::new(market, &self.orders, self.store.as_ref());
        let (terminal, filled, used) = {
            let order = w.load(order_id).await?;
            (order.is_terminal(), order.filled_amount, order.used_funds)
        };
        if terminal {
            return Ok(Projection {
                market_id: market.id.clone(),
                duplicate: true,
                ..Default::default()
            });
        }

        warn!(market = %market.id, order_id, "Applying synthetic cancellation");
        self.apply_status(&mut w, order_id, OrderStatus::Cancelled, filled, used, ts)
            .await?;
        self.commit(w, None).await
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    async fn apply_event(&self, w: &mut Working<'_>, event: &EngineEvent) -> Result<()> {
        let ts = event.timestamp;
        match &event.kind {
            EventKind::OrderAccepted { order_id, .. } => {
                let order = w.load(*order_id).await?;
                if order.status == OrderStatus::Pending {
                    order.status = OrderStatus::Untouched;
                }
                order.updated_at = ts;
                if let Some(container_id) = w.container_of(*order_id).await? {
                    self.sync_leg(w, container_id, *order_id, ts).await?;
                }
            }
            EventKind::OrderStatusChange {
                order_id,
                status,
                filled_amount,
                used_funds,
                ..
            } => {
                self.apply_status(w, *order_id, *status, *filled_amount, *used_funds, ts)
                    .await?;
            }
            EventKind::NewTrade(trade) => {
                self.apply_trade(w, trade, ts).await?;
            }
            EventKind::StopActivated { order_id, .. } => {
                let order = w.load(*order_id).await?;
                order.triggered = true;
                order.updated_at = ts;
            }
            EventKind::TrailingPriceUpdated {
                order_id, watermark, ..
            } => {
                let order = w.load(*order_id).await?;
                order.trailing_watermark = *watermark;
                order.updated_at = ts;
            }
            EventKind::OrderCancelFailed { .. } => {}
        }
        Ok(())
    }

    async fn apply_status(
        &self,
        w: &mut Working<'_>,
        order_id: u64,
        status: OrderStatus,
        filled_amount: u64,
        used_funds: u64,
        ts: i64,
    ) -> Result<()> {
        let (delta_filled, delta_used, side) = {
            let order = w.load(order_id).await?;
            if order.is_terminal() {
                warn!(order_id, current = %order.status, incoming = %status, "Ignoring status change of terminal order");
                return Ok(());
            }
            let delta_filled = filled_amount.saturating_sub(order.filled_amount);
            let delta_used = used_funds.saturating_sub(order.used_funds);
            order.status = status;
            order.filled_amount = filled_amount;
            order.used_funds = used_funds;
            order.updated_at = ts;
            (delta_filled, delta_used, order.side)
        };

        match w.container_of(order_id).await? {
            Some(container_id) => {
                let container = w.load(container_id).await?;
                container.filled_amount = container.filled_amount.saturating_add(delta_filled);
                if side == container.side {
                    container.used_funds = container.used_funds.saturating_add(delta_used);
                } else {
                    container.opposite_used_funds =
                        container.opposite_used_funds.saturating_add(delta_used);
                }
                let is_oco = container.order_type == OrderType::Oco;
                if is_oco && delta_filled > 0 {
                    self.shrink_sibling_claims(w, container_id, order_id).await?;
                }
                if is_oco && status == OrderStatus::Cancelled {
                    self.release_cancelled_claim(w, container_id, order_id).await?;
                }
                self.sync_leg(w, container_id, order_id, ts).await?;
            }
            None if status.is_terminal() => {
                let order = w.load(order_id).await?;
                let (owner, residual) = (order.owner(), order.residual_funds());
                w.unlock(owner, side, residual, order_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn apply_trade(&self, w: &mut Working<'_>, trade: &Trade, ts: i64) -> Result<()> {
        let market = w.market;
        let maker_side = trade.taker_side.opposite();
        let received = |side: Side| match side {
            Side::Buy => trade.volume,
            Side::Sell => trade.quote_volume,
        };

        let maker_fee = self
            .fees
            .fee(trade.maker_owner_id, true, received(maker_side))?;
        let taker_fee = self
            .fees
            .fee(trade.taker_owner_id, false, received(trade.taker_side))?;

        let maker = AccountKey::new(trade.maker_owner_id, trade.maker_sub_account);
        let taker = AccountKey::new(trade.taker_owner_id, trade.taker_sub_account);
        let (buyer, seller, buyer_fee, seller_fee) = match trade.taker_side {
            Side::Buy => (taker, maker, taker_fee, maker_fee),
            Side::Sell => (maker, taker, maker_fee, taker_fee),
        };

        w.funds.push(FundsOp::Settle {
            trade_seq: trade.trade_seq,
            maker_order_id: trade.maker_order_id,
            taker_order_id: trade.taker_order_id,
            buyer,
            seller,
            volume: trade.volume,
            quote_volume: trade.quote_volume,
            buyer_fee,
            seller_fee,
        });

        for (order_id, fee) in [
            (trade.maker_order_id, maker_fee),
            (trade.taker_order_id, taker_fee),
        ] {
            let order = w.load(order_id).await?;
            if order.is_terminal() {
                error!(
                    market = %market.id,
                    trade_seq = trade.trade_seq,
                    order_id,
                    status = %order.status,
                    filled = order.filled_amount,
                    used = order.used_funds,
                    locked = order.locked_funds,
                    "Trade for a closed order, its funds may already be released"
                );
            }
            order.filled_quote = order.filled_quote.saturating_add(trade.quote_volume);
            order.fee_amount = order.fee_amount.saturating_add(fee);
            order.updated_at = ts;

            if let Some(container_id) = w.container_of(order_id).await? {
                let container = w.load(container_id).await?;
                container.filled_quote = container.filled_quote.saturating_add(trade.quote_volume);
                container.fee_amount = container.fee_amount.saturating_add(fee);
                container.updated_at = ts;
            }
        }

        let record = TradeRecord::from_trade(
            self.sequencer.next_trade_id(),
            &market.id,
            trade,
            maker_fee,
            taker_fee,
            ts,
        );
        w.trades.push(record);
        Ok(())
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// Cap every live sibling's claim at the container's remaining amount
    async fn shrink_sibling_claims(
        &self,
        w: &mut Working<'_>,
        container_id: u64,
        filled_leg: u64,
    ) -> Result<()> {
        let (remaining, siblings) = {
            let container = w.load(container_id).await?;
            let siblings: Vec<u64> = container.legs().filter(|id| *id != filled_leg).collect();
            (container.remaining(), siblings)
        };
        let market = w.market;

        for sibling_id in siblings {
            let sibling = w.load(sibling_id).await?;
            if sibling.is_terminal() {
                continue;
            }
            let price = if sibling.price > 0 {
                sibling.price
            } else {
                sibling.stop_price
            };
            let claim = claim_for(market, sibling.side, price, remaining)?;
            sibling.locked_funds = sibling.locked_funds.min(claim);
        }
        Ok(())
    }

    /// Give back what the container holds beyond the claim of its live
    /// legs once `cancelled_leg` is out
    ///
    /// Legs share the container's lock, so only the part no live leg can
    /// still spend is released. The row is booked under the cancelled leg,
    /// which keeps it apart from the container's final release.
    async fn release_cancelled_claim(
        &self,
        w: &mut Working<'_>,
        container_id: u64,
        cancelled_leg: u64,
    ) -> Result<()> {
        let (remaining, siblings) = {
            let container = w.load(container_id).await?;
            if container.is_terminal() {
                return Ok(());
            }
            let siblings: Vec<u64> = container.legs().filter(|id| *id != cancelled_leg).collect();
            (container.remaining(), siblings)
        };
        let market = w.market;

        let mut live_claim = None;
        for sibling_id in siblings {
            let sibling = w.load(sibling_id).await?;
            if sibling.is_terminal() {
                continue;
            }
            let claim = claim_for(market, sibling.side, sibling.price, remaining)?;
            live_claim = Some(live_claim.map_or(claim, |c: u64| c.max(claim)));
        }
        // Last leg out: the container closes and releases everything
        let Some(live_claim) = live_claim else {
            return Ok(());
        };

        let container = w.load(container_id).await?;
        let excess = container.residual_funds().saturating_sub(live_claim);
        if excess == 0 {
            return Ok(());
        }
        container.locked_funds -= excess;
        let (owner, side) = (container.owner(), container.side);
        debug!(
            order_id = container_id,
            leg_id = cancelled_leg,
            released = excess,
            kept = live_claim,
            "Cancelled leg claim released"
        );
        w.unlock(owner, side, excess, cancelled_leg);
        Ok(())
    }

    async fn sync_leg(
        &self,
        w: &mut Working<'_>,
        container_id: u64,
        leg_id: u64,
        ts: i64,
    ) -> Result<()> {
        let (status, filled) = {
            let leg = w.load(leg_id).await?;
            (leg.status, leg.filled_amount)
        };

        let container = w.load(container_id).await?;
        if container.tp_order_id == Some(leg_id) {
            container.tp_status = Some(status);
            container.tp_filled_amount = filled;
        } else if container.sl_order_id == Some(leg_id) {
            container.sl_status = Some(status);
            container.sl_filled_amount = filled;
        }
        container.updated_at = ts;

        self.refresh_container(w, container_id, ts).await
    }

    async fn refresh_container(&self, w: &mut Working<'_>, container_id: u64, ts: i64) -> Result<()> {
        let container = w.load(container_id).await?;
        if container.is_terminal() {
            return Ok(());
        }
        let statuses: Vec<OrderStatus> = [container.tp_status, container.sl_status]
            .into_iter()
            .flatten()
            .collect();
        if statuses.is_empty() {
            return Ok(());
        }

        if !statuses.iter().all(|s| s.is_terminal()) {
            container.status = if container.filled_amount > 0 {
                OrderStatus::PartiallyFilled
            } else if statuses
                .iter()
                .any(|s| *s != OrderStatus::Pending && !s.is_terminal())
            {
                OrderStatus::Untouched
            } else {
                OrderStatus::Pending
            };
            return Ok(());
        }

        container.status = if statuses.contains(&OrderStatus::Filled) {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };
        container.updated_at = ts;

        let owner = container.owner();
        let side = container.side;
        let residual = container.residual_funds();
        let opposite_residual = match container.order_type {
            OrderType::Straddle | OrderType::Strangle => container
                .previous_opposite_locked_funds
                .saturating_sub(container.opposite_used_funds),
            _ => 0,
        };
        info!(
            order_id = container_id,
            status = %container.status,
            filled = container.filled_amount,
            "Container closed"
        );

        w.unlock(owner, side, residual, container_id);
        w.unlock(owner, side.opposite(), opposite_residual, container_id);
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    async fn commit(&self, w: Working<'_>, seq_id: Option<u64>) -> Result<Projection> {
        let market = w.market;
        let (changes, funds_ops, trades) = w.into_changes();

        for op in funds_ops {
            match op {
                FundsOp::Unlock {
                    owner,
                    coin,
                    amount,
                    order_id,
                } => {
                    self.funds
                        .unlock(owner, &coin, amount, &LedgerRef::order(order_id))
                        .await?;
                }
                FundsOp::Settle {
                    trade_seq,
                    maker_order_id,
                    taker_order_id,
                    buyer,
                    seller,
                    volume,
                    quote_volume,
                    buyer_fee,
                    seller_fee,
                } => {
                    let settled = self
                        .funds
                        .settle_trade(&TradeSettlement {
                            market,
                            trade_seq,
                            buyer,
                            seller,
                            volume,
                            quote_volume,
                            buyer_fee,
                            seller_fee,
                        })
                        .await;
                    if let Err(e) = settled {
                        error!(
                            market = %market.id,
                            trade_seq,
                            maker_order_id,
                            taker_order_id,
                            buyer = %buyer,
                            seller = %seller,
                            volume,
                            quote_volume,
                            error = %e,
                            "Trade settlement failed, reconcile before restart"
                        );
                        return Err(e.into());
                    }
                }
            }
        }

        let batch = ProjectionBatch {
            market_id: market.id.clone(),
            seq_id,
            orders: changes.iter().map(|c| c.after.clone()).collect(),
            trades: trades.clone(),
        };
        self.store.apply_projection(&batch).await?;

        for change in &changes {
            if change.after.is_terminal() {
                self.orders.remove(&market.id, change.after.id);
            } else {
                self.orders.put(change.after.clone());
            }
        }

        if !changes.is_empty() || !trades.is_empty() {
            self.publish_sync(SyncRecord {
                market_id: market.id.clone(),
                seq_id: seq_id.unwrap_or(0),
                order_ids: changes.iter().map(|c| c.after.id).collect(),
                trade_ids: trades.iter().map(|t| t.id).collect(),
            })
            .await;
        }

        Ok(Projection {
            market_id: market.id.clone(),
            seq_id: seq_id.unwrap_or(0),
            duplicate: false,
            changes,
            trades,
        })
    }

    async fn publish_sync(&self, record: SyncRecord) {
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode sync record");
                return;
            }
        };
        if let Err(e) = self.log.append(topics::SYNC_DATA, payload).await {
            warn!(market = %record.market_id, error = %e, "Failed to publish sync record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeRates;
    use crate::store::InMemoryOrderStore;
    use assert_matches::assert_matches;
    use common::{MarketStatus, StopKind};
    use fms::InMemoryLiabilityStore;
    use matching_engine::CancelFailReason;
    use storage::{DurableLog, InMemoryLog};

    const SELLER: AccountKey = AccountKey {
        user_id: 1,
        sub_account: 0,
    };
    const BUYER: AccountKey = AccountKey {
        user_id: 2,
        sub_account: 0,
    };
    const FEES: AccountKey = AccountKey {
        user_id: 0,
        sub_account: 0,
    };

    fn btc_usdt() -> Market {
        Market {
            id: "btcusdt".to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            base_precision: 4,
            quote_precision: 2,
            min_base_volume: 0,
            min_quote_volume: 0,
            max_base_price: 0,
            max_quote_price: 0,
            max_quote_spend: 0,
            status: MarketStatus::Active,
        }
    }

    struct Fixture {
        projector: Projector,
        funds: Arc<FundsManager>,
        store: Arc<InMemoryOrderStore>,
        log: Arc<InMemoryLog>,
        seq: u64,
    }

    impl Fixture {
        async fn new(taker_bps: u64) -> Self {
            let funds = Arc::new(FundsManager::new(
                Arc::new(InMemoryLiabilityStore::new()),
                FEES,
            ));
            funds.deposit(SELLER, "BTC", 100_000, "d-1").await.unwrap();
            funds.deposit(BUYER, "USDT", 10_000_000, "d-2").await.unwrap();

            let store = Arc::new(InMemoryOrderStore::new());
            let log = Arc::new(InMemoryLog::new());
            let projector = Projector::new(
                Arc::new(OrderManager::new()),
                store.clone(),
                funds.clone(),
                Arc::new(Sequencer::new()),
                FeeSchedule::new(FeeRates {
                    maker_bps: 0,
                    taker_bps,
                }),
                vec![btc_usdt()],
                log.clone(),
            );
            Self {
                projector,
                funds,
                store,
                log,
                seq: 0,
            }
        }

        async fn place(&self, order: Order, lock: bool) {
            if lock {
                let coin = btc_usdt().funds_coin(order.side).to_string();
                self.funds
                    .lock(order.owner(), &coin, order.locked_funds, &LedgerRef::order(order.id))
                    .await
                    .unwrap();
            }
            self.store.insert_order(&order).await.unwrap();
            self.projector.orders().put(order);
        }

        async fn emit(&mut self, kind: EventKind) -> Result<Projection> {
            self.seq += 1;
            self.projector
                .project(&EngineEvent {
                    market_id: "btcusdt".to_string(),
                    seq_id: self.seq,
                    timestamp: self.seq as i64,
                    kind,
                })
                .await
        }

        async fn order(&self, id: u64) -> Order {
            self.store.get_order(id).await.unwrap().unwrap()
        }
    }

    fn limit(id: u64, owner: AccountKey, side: Side, price: u64, amount: u64) -> Order {
        let mut order = Order::new(id, owner, "btcusdt", side, OrderType::Limit, 0);
        order.price = price;
        order.amount = amount;
        order.locked_funds = claim_for(&btc_usdt(), side, price, amount).unwrap();
        order
    }

    fn status(order_id: u64, owner: AccountKey, status: OrderStatus, filled: u64, used: u64) -> EventKind {
        EventKind::OrderStatusChange {
            order_id,
            owner_id: owner.user_id,
            sub_account: owner.sub_account,
            side: Side::Buy,
            status,
            filled_amount: filled,
            used_funds: used,
        }
    }

    fn trade(seq: u64, maker: (u64, AccountKey), taker: (u64, AccountKey), taker_side: Side, price: u64, volume: u64) -> EventKind {
        EventKind::NewTrade(Trade {
            trade_seq: seq,
            taker_side,
            maker_order_id: maker.0,
            maker_owner_id: maker.1.user_id,
            maker_sub_account: maker.1.sub_account,
            taker_order_id: taker.0,
            taker_owner_id: taker.1.user_id,
            taker_sub_account: taker.1.sub_account,
            price,
            volume,
            quote_volume: btc_usdt().quote_value(price, volume).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_simple_match_settles_and_releases() {
        let mut fx = Fixture::new(10).await;
        fx.place(limit(1, SELLER, Side::Sell, 3_000_000, 10_000), true).await;
        fx.place(limit(2, BUYER, Side::Buy, 3_100_000, 5_000), true).await;

        fx.emit(EventKind::OrderAccepted {
            order_id: 1,
            owner_id: 1,
            sub_account: 0,
            side: Side::Sell,
        })
        .await
        .unwrap();
        let projection = fx
            .emit(trade(1, (1, SELLER), (2, BUYER), Side::Buy, 3_000_000, 5_000))
            .await
            .unwrap();
        assert_eq!(projection.trades.len(), 1);
        fx.emit(status(1, SELLER, OrderStatus::PartiallyFilled, 5_000, 5_000))
            .await
            .unwrap();
        let projection = fx
            .emit(status(2, BUYER, OrderStatus::Filled, 5_000, 1_500_000))
            .await
            .unwrap();
        assert!(projection.change(2).unwrap().became_terminal());

        let seller_order = fx.order(1).await;
        assert_eq!(seller_order.status, OrderStatus::PartiallyFilled);
        assert_eq!(seller_order.used_funds, 5_000);
        assert_eq!(fx.order(2).await.fee_amount, 5);

        // Seller keeps 0.5 locked, receives 15000.00
        let seller_btc = fx.funds.balance(SELLER, "BTC").await;
        assert_eq!((seller_btc.available, seller_btc.locked), (90_000, 5_000));
        assert_eq!(fx.funds.get_available(SELLER, "USDT").await, 1_500_000);

        // Buyer locked 15500.00, spent 15000.00, got the residual 500.00 back
        let buyer_usdt = fx.funds.balance(BUYER, "USDT").await;
        assert_eq!((buyer_usdt.available, buyer_usdt.locked), (8_500_000, 0));
        assert_eq!(fx.funds.get_available(BUYER, "BTC").await, 4_995);
        assert_eq!(fx.funds.get_available(FEES, "BTC").await, 5);

        // Filled order leaves memory, partially filled one stays
        assert!(fx.projector.orders().locate(2).is_none());
        assert!(fx.projector.orders().locate(1).is_some());
    }

    #[tokio::test]
    async fn test_replay_is_noop_and_gap_is_corruption() {
        let mut fx = Fixture::new(0).await;
        fx.place(limit(1, SELLER, Side::Sell, 3_000_000, 10_000), true).await;
        fx.emit(status(1, SELLER, OrderStatus::Cancelled, 0, 0)).await.unwrap();
        assert_eq!(fx.funds.get_available(SELLER, "BTC").await, 100_000);

        let replay = fx
            .projector
            .project(&EngineEvent {
                market_id: "btcusdt".to_string(),
                seq_id: 1,
                timestamp: 1,
                kind: status(1, SELLER, OrderStatus::Cancelled, 0, 0),
            })
            .await
            .unwrap();
        assert!(replay.duplicate);

        let gap = fx
            .projector
            .project(&EngineEvent {
                market_id: "btcusdt".to_string(),
                seq_id: 5,
                timestamp: 5,
                kind: EventKind::OrderCancelFailed {
                    order_id: 1,
                    owner_id: 1,
                    sub_account: 0,
                    reason: CancelFailReason::AlreadyCancelled,
                },
            })
            .await;
        assert_matches!(
            gap,
            Err(OmsError::ProjectionCorruption { expected: 2, got: 5, .. })
        );
        assert_eq!(fx.store.applied_seq("btcusdt").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_synthetic_cancel_wins_over_late_engine_event() {
        let mut fx = Fixture::new(0).await;
        fx.place(limit(1, BUYER, Side::Buy, 3_000_000, 10_000), true).await;
        assert_eq!(fx.funds.balance(BUYER, "USDT").await.locked, 3_000_000);

        let projection = fx
            .projector
            .apply_synthetic_cancel("btcusdt", 1, 99)
            .await
            .unwrap();
        assert_eq!(projection.seq_id, 0);
        assert_eq!(fx.order(1).await.status, OrderStatus::Cancelled);
        assert_eq!(fx.funds.balance(BUYER, "USDT").await.locked, 0);

        // The engine's own cancellation arrives later and changes nothing
        let late = fx
            .emit(status(1, BUYER, OrderStatus::Cancelled, 0, 0))
            .await
            .unwrap();
        assert!(late.changes.is_empty());
        assert_eq!(fx.funds.get_available(BUYER, "USDT").await, 10_000_000);

        let again = fx
            .projector
            .apply_synthetic_cancel("btcusdt", 1, 100)
            .await
            .unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn test_trade_after_synthetic_cancel_fails_without_side_effects() {
        let mut fx = Fixture::new(0).await;
        fx.place(limit(1, SELLER, Side::Sell, 3_000_000, 10_000), true).await;
        fx.place(limit(2, BUYER, Side::Buy, 3_000_000, 5_000), true).await;

        fx.projector
            .apply_synthetic_cancel("btcusdt", 1, 50)
            .await
            .unwrap();
        assert_eq!(fx.funds.balance(SELLER, "BTC").await.locked, 0);

        // The engine had already matched the order: nothing left to settle from
        let late = fx
            .emit(trade(1, (1, SELLER), (2, BUYER), Side::Buy, 3_000_000, 5_000))
            .await;
        assert_matches!(late, Err(OmsError::Funds(_)));

        assert_eq!(fx.store.applied_seq("btcusdt").await.unwrap(), 0);
        let seller_order = fx.order(1).await;
        assert_eq!(seller_order.status, OrderStatus::Cancelled);
        assert_eq!(seller_order.filled_quote, 0);
        let seller_btc = fx.funds.balance(SELLER, "BTC").await;
        assert_eq!((seller_btc.available, seller_btc.locked), (100_000, 0));
        assert_eq!(fx.funds.balance(BUYER, "USDT").await.locked, 1_500_000);
        assert!(fx.store.recent_trades("btcusdt", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oco_partial_fill_shrinks_sibling_claim() {
        let mut fx = Fixture::new(0).await;

        // Sell OCO on 1.0000 BTC: TP limit at 110.00, SL stop-loss at 90.00
        let mut root = Order::new(6, SELLER, "btcusdt", Side::Sell, OrderType::Oco, 0);
        root.amount = 10_000;
        root.locked_funds = 10_000;
        root.tp_price = 11_000;
        root.sl_price = 9_000;
        root.tp_order_id = Some(7);
        root.sl_order_id = Some(8);
        root.tp_status = Some(OrderStatus::Pending);
        root.sl_status = Some(OrderStatus::Pending);

        let mut tp = limit(7, SELLER, Side::Sell, 11_000, 10_000);
        tp.parent_order_id = Some(6);
        tp.root_order_id = Some(6);
        let mut sl = limit(8, SELLER, Side::Sell, 9_000, 10_000);
        sl.stop = StopKind::Loss;
        sl.stop_price = 9_000;
        sl.parent_order_id = Some(6);
        sl.root_order_id = Some(6);

        fx.place(root, true).await;
        fx.place(tp, false).await;
        fx.place(sl, false).await;
        fx.place(limit(9, BUYER, Side::Buy, 11_000, 3_000), true).await;

        fx.emit(trade(1, (7, SELLER), (9, BUYER), Side::Buy, 11_000, 3_000))
            .await
            .unwrap();
        fx.emit(status(7, SELLER, OrderStatus::PartiallyFilled, 3_000, 3_000))
            .await
            .unwrap();

        let container = fx.projector.orders().locate(6).unwrap();
        assert_eq!(container.status, OrderStatus::PartiallyFilled);
        assert_eq!(container.filled_amount, 3_000);
        assert_eq!(container.tp_filled_amount, 3_000);
        assert_eq!(fx.projector.orders().locate(8).unwrap().locked_funds, 7_000);

        // SL cancelled: TP still claims the same 0.7000 BTC, nothing is released
        fx.emit(status(8, SELLER, OrderStatus::Cancelled, 0, 0)).await.unwrap();
        assert_eq!(fx.order(8).await.locked_funds, 7_000);
        assert_eq!(fx.funds.balance(SELLER, "BTC").await.locked, 7_000);

        // TP cancelled: container releases the remaining 0.7000 BTC
        let projection = fx
            .emit(status(7, SELLER, OrderStatus::Cancelled, 3_000, 3_000))
            .await
            .unwrap();
        assert!(projection.change(6).unwrap().became_terminal());
        let container = fx.order(6).await;
        assert_eq!(container.status, OrderStatus::Cancelled);
        assert_eq!(container.sl_status, Some(OrderStatus::Cancelled));
        assert_eq!(fx.funds.balance(SELLER, "BTC").await.locked, 0);
        assert_eq!(fx.funds.get_available(SELLER, "BTC").await, 97_000);
    }

    #[tokio::test]
    async fn test_buy_oco_sibling_cancel_releases_excess_claim() {
        let mut fx = Fixture::new(0).await;

        // Buy OCO on 1.0000 BTC: TP limit at 90.00, SL stop-loss at 110.00,
        // the container locks the dearer 110.00
        let mut root = Order::new(6, BUYER, "btcusdt", Side::Buy, OrderType::Oco, 0);
        root.amount = 10_000;
        root.locked_funds = 11_000;
        root.tp_price = 9_000;
        root.sl_price = 11_000;
        root.tp_order_id = Some(7);
        root.sl_order_id = Some(8);
        root.tp_status = Some(OrderStatus::Pending);
        root.sl_status = Some(OrderStatus::Pending);

        let mut tp = limit(7, BUYER, Side::Buy, 9_000, 10_000);
        tp.parent_order_id = Some(6);
        tp.root_order_id = Some(6);
        let mut sl = limit(8, BUYER, Side::Buy, 11_000, 10_000);
        sl.stop = StopKind::Loss;
        sl.stop_price = 11_000;
        sl.parent_order_id = Some(6);
        sl.root_order_id = Some(6);

        fx.place(root, true).await;
        fx.place(tp, false).await;
        fx.place(sl, false).await;
        fx.place(limit(9, SELLER, Side::Sell, 9_000, 3_000), true).await;

        // 0.3000 filled at 90.00 for 27.00
        fx.emit(trade(1, (7, BUYER), (9, SELLER), Side::Sell, 9_000, 3_000))
            .await
            .unwrap();
        fx.emit(status(7, BUYER, OrderStatus::PartiallyFilled, 3_000, 2_700))
            .await
            .unwrap();
        assert_eq!(fx.projector.orders().locate(8).unwrap().locked_funds, 7_700);
        assert_eq!(fx.funds.balance(BUYER, "USDT").await.locked, 8_300);

        // SL cancelled: TP needs 90.00 x 0.7 = 63.00, the other 20.00 goes back
        let projection = fx
            .emit(status(8, BUYER, OrderStatus::Cancelled, 0, 0))
            .await
            .unwrap();
        assert!(!projection.change(6).unwrap().became_terminal());
        assert_eq!(fx.order(6).await.locked_funds, 9_000);
        let usdt = fx.funds.balance(BUYER, "USDT").await;
        assert_eq!((usdt.available, usdt.locked), (9_991_000, 6_300));

        // TP cancelled: the container releases the rest, no double release
        fx.emit(status(7, BUYER, OrderStatus::Cancelled, 3_000, 2_700))
            .await
            .unwrap();
        assert_eq!(fx.order(6).await.status, OrderStatus::Cancelled);
        let usdt = fx.funds.balance(BUYER, "USDT").await;
        assert_eq!((usdt.available, usdt.locked), (9_997_300, 0));
        assert_eq!(fx.funds.get_available(BUYER, "BTC").await, 3_000);
    }

    #[tokio::test]
    async fn test_stop_and_trailing_state_is_recorded() {
        let mut fx = Fixture::new(0).await;
        let mut trailing = limit(1, SELLER, Side::Sell, 0, 10_000);
        trailing.order_type = OrderType::TrailingStop;
        fx.place(trailing, true).await;

        fx.emit(EventKind::TrailingPriceUpdated {
            order_id: 1,
            owner_id: 1,
            sub_account: 0,
            watermark: 11_000,
            trigger_price: 10_800,
        })
        .await
        .unwrap();
        let projection = fx
            .emit(EventKind::StopActivated {
                order_id: 1,
                owner_id: 1,
                sub_account: 0,
                side: Side::Sell,
                order_type: OrderType::Market,
                stop_price: 10_800,
            })
            .await
            .unwrap();

        assert!(projection.change(1).unwrap().became_triggered());
        let order = fx.projector.orders().locate(1).unwrap();
        assert_eq!(order.trailing_watermark, 11_000);
        assert!(order.triggered);
    }

    #[tokio::test]
    async fn test_projection_publishes_sync_record() {
        let mut fx = Fixture::new(0).await;
        fx.place(limit(4, SELLER, Side::Sell, 3_000_000, 10_000), true).await;
        fx.emit(status(4, SELLER, OrderStatus::Cancelled, 0, 0)).await.unwrap();

        let records = fx.log.read(topics::SYNC_DATA, 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let record: SyncRecord = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(record.order_ids, vec![4]);
        assert_eq!(record.seq_id, 1);
    }

    #[tokio::test]
    async fn test_unknown_order_is_an_error() {
        let mut fx = Fixture::new(0).await;
        let result = fx.emit(status(42, BUYER, OrderStatus::Cancelled, 0, 0)).await;
        assert_matches!(result, Err(OmsError::NotFound(42)));
        assert_eq!(fx.store.applied_seq("btcusdt").await.unwrap(), 0);
    }

    async fn snapshot(fx: &Fixture) -> Vec<(BalanceCellKey, fms::BalanceCell)> {
        let mut cells = Vec::new();
        for owner in [SELLER, BUYER, FEES] {
            for coin in ["BTC", "USDT"] {
                cells.push(((owner.user_id, coin), fx.funds.balance(owner, coin).await));
            }
        }
        cells
    }

    type BalanceCellKey = (u64, &'static str);

    fn order_state(order: &Order) -> (OrderStatus, u64, u64, u64) {
        (order.status, order.filled_amount, order.used_funds, order.fee_amount)
    }

    proptest::proptest! {
        #[test]
        fn prop_replaying_a_suffix_changes_nothing(volume in 1u64..=10_000, from in 0usize..4) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut fx = Fixture::new(10).await;
                fx.place(limit(1, SELLER, Side::Sell, 3_000_000, 10_000), true).await;
                fx.place(limit(2, BUYER, Side::Buy, 3_000_000, volume), true).await;

                let quote = btc_usdt().quote_value(3_000_000, volume).unwrap();
                let seller = if volume == 10_000 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                let kinds = vec![
                    EventKind::OrderAccepted {
                        order_id: 1,
                        owner_id: 1,
                        sub_account: 0,
                        side: Side::Sell,
                    },
                    trade(1, (1, SELLER), (2, BUYER), Side::Buy, 3_000_000, volume),
                    status(1, SELLER, seller, volume, volume),
                    status(2, BUYER, OrderStatus::Filled, volume, quote),
                ];

                let mut events = Vec::new();
                for kind in kinds {
                    fx.seq += 1;
                    let event = EngineEvent {
                        market_id: "btcusdt".to_string(),
                        seq_id: fx.seq,
                        timestamp: fx.seq as i64,
                        kind,
                    };
                    fx.projector.project(&event).await.unwrap();
                    events.push(event);
                }

                let balances = snapshot(&fx).await;
                let orders = (order_state(&fx.order(1).await), order_state(&fx.order(2).await));
                let trades = fx.store.recent_trades("btcusdt", 10).await.unwrap().len();

                for event in &events[from..] {
                    let replay = fx.projector.project(event).await.unwrap();
                    assert!(replay.duplicate);
                }

                assert_eq!(snapshot(&fx).await, balances);
                assert_eq!(
                    (order_state(&fx.order(1).await), order_state(&fx.order(2).await)),
                    orders
                );
                assert_eq!(fx.store.recent_trades("btcusdt", 10).await.unwrap().len(), trades);
                assert_eq!(trades, 1);
            });
        }
    }
}
