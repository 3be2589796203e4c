//! Startup recovery
//!
//! Rebuilds a market from the durable log and the order store before its
//! engine accepts commands:
//!
//! 1. Project logged events the store has not applied yet
//! 2. Seed the engine's event and trade sequences from the log tail
//! 3. Restore live orders into the book with their residuals
//! 4. Collect `pending` orders, which never reached the engine, for
//!    re-submission once the engine runs
//!
//! Everything here is idempotent: projection skips applied `seq_id`s and
//! FMS dedups its movements, so recovering twice changes nothing.

use std::sync::Arc;
use tracing::{info, warn};

use common::{now_nanos, Market, OrderStatus};
use config::{EngineConfig, RecoveryConfig};
use matching_engine::{Command, EngineEvent, MarketEngine};
use oms::{Projection, Projector, Sequencer, SyncRecord};
use storage::{topics, SharedLog};

use crate::price_feed::LastPriceCache;
use crate::Result;

/// A market ready to start
pub struct RecoveredMarket {
    pub engine: MarketEngine,
    /// Orders to publish as fresh commands after the engine started
    pub resubmit: Vec<Command>,
    /// Projections of caught-up events, for orchestration
    pub caught_up: Vec<Projection>,
    pub restored: usize,
}

pub struct Recovery {
    projector: Arc<Projector>,
    log: SharedLog,
    prices: Arc<LastPriceCache>,
    config: RecoveryConfig,
}

impl Recovery {
    pub fn new(
        projector: Arc<Projector>,
        log: SharedLog,
        prices: Arc<LastPriceCache>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            projector,
            log,
            prices,
            config,
        }
    }

    /// Move the global id counters past every id already issued
    ///
    /// Ids may be in the store, in the sync feed, or only in the event log
    /// when the process died before projecting.
    pub async fn seed_sequencer(&self, sequencer: &Sequencer, markets: &[Market]) -> Result<()> {
        let (mut last_order, mut last_trade) = self.projector.store().max_ids().await?;

        for record in self
            .log
            .read_tail(topics::SYNC_DATA, self.config.history_window)
            .await?
        {
            match serde_json::from_slice::<SyncRecord>(&record.payload) {
                Ok(sync) => {
                    last_order = last_order.max(sync.max_order_id());
                    last_trade = last_trade.max(sync.max_trade_id());
                }
                Err(e) => warn!(offset = record.offset, error = %e, "Skipping unreadable sync record"),
            }
        }

        for market in markets {
            for event in self.tail(&market.id).await? {
                if let Some(order_id) = event.order_id() {
                    last_order = last_order.max(order_id);
                }
            }
        }

        sequencer.seed(last_order, last_trade);
        info!(
            last_order_id = sequencer.last_order_id(),
            last_trade_id = sequencer.last_trade_id(),
            "Seeded id sequencer"
        );
        Ok(())
    }

    /// Decoded tail of `events.<market>`, oldest first
    async fn tail(&self, market_id: &str) -> Result<Vec<EngineEvent>> {
        let records = self
            .log
            .read_tail(&topics::events(market_id), self.config.history_window)
            .await?;

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match EngineEvent::decode(&record.payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(market = market_id, offset = record.offset, error = %e, "Skipping unreadable event"),
            }
        }
        events.sort_by_key(|e| e.seq_id);
        events.dedup_by_key(|e| e.seq_id);
        Ok(events)
    }

    /// Rebuild one market's engine
    pub async fn recover_market(
        &self,
        market: &Market,
        engine_config: &EngineConfig,
    ) -> Result<RecoveredMarket> {
        let store = self.projector.store();
        let tail = self.tail(&market.id).await?;

        // Catch up on events logged but not projected
        self.projector.reset_watermark(&market.id).await;
        let applied = store.applied_seq(&market.id).await?;
        let mut caught_up = Vec::new();
        for event in tail.iter().filter(|e| e.seq_id > applied) {
            let projection = self.projector.project(event).await?;
            if !projection.duplicate {
                caught_up.push(projection);
            }
        }

        let event_seq = tail
            .last()
            .map(|e| e.seq_id)
            .unwrap_or(0)
            .max(store.applied_seq(&market.id).await?);
        let tail_trade_seq = tail
            .iter()
            .filter_map(|e| e.trade().map(|t| t.trade_seq))
            .max()
            .unwrap_or(0);
        let trade_seq = tail_trade_seq.max(store.max_trade_seq(&market.id).await?);

        let mut engine = MarketEngine::new(
            market.id.clone(),
            market.base_precision,
            engine_config.terminated_cache_size,
        );
        engine.seed(event_seq, trade_seq);

        let last_price = match tail.iter().rev().find_map(|e| e.trade().map(|t| t.price)) {
            Some(price) => Some(price),
            None => store.last_trade_price(&market.id).await?,
        };
        if let Some(price) = last_price {
            engine.set_last_price(price);
            self.prices.update(&market.id, price);
        }

        let mut restored = 0;
        let mut resubmit = Vec::new();
        for order in store.open_orders(&market.id).await? {
            self.projector.orders().put(order.clone());
            if order.is_container() {
                continue;
            }
            match order.status {
                OrderStatus::Pending => resubmit.push(Command::NewOrder(order.to_command())),
                OrderStatus::Untouched | OrderStatus::PartiallyFilled => {
                    match engine.restore(order.to_command()) {
                        Ok(()) => restored += 1,
                        Err(e) => {
                            warn!(
                                market = %market.id,
                                order_id = order.id,
                                error = %e,
                                "Order cannot be restored, cancelling"
                            );
                            self.projector
                                .apply_synthetic_cancel(&market.id, order.id, now_nanos())
                                .await?;
                        }
                    }
                }
                _ => {}
            }
        }

        info!(
            market = %market.id,
            event_seq,
            trade_seq,
            caught_up = caught_up.len(),
            restored,
            resubmit = resubmit.len(),
            "Market recovered"
        );
        Ok(RecoveredMarket {
            engine,
            resubmit,
            caught_up,
            restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountKey, MarketStatus, OrderType, Side};
    use fms::{FundsManager, InMemoryLiabilityStore};
    use oms::{FeeRates, FeeSchedule, InMemoryOrderStore, Order, OrderManager, OrderStore};
    use crate::price_feed::PriceFeed;
    use storage::{DurableLog, InMemoryLog};

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
        recovery: Recovery,
        store: Arc<InMemoryOrderStore>,
        log: Arc<InMemoryLog>,
        prices: Arc<LastPriceCache>,
        sequencer: Arc<Sequencer>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryOrderStore::new());
        let log = Arc::new(InMemoryLog::new());
        let prices = Arc::new(LastPriceCache::new());
        let sequencer = Arc::new(Sequencer::new());
        let projector = Arc::new(Projector::new(
            Arc::new(OrderManager::new()),
            store.clone(),
            Arc::new(FundsManager::new(
                Arc::new(InMemoryLiabilityStore::new()),
                AccountKey::new(0, 0),
            )),
            sequencer.clone(),
            FeeSchedule::new(FeeRates {
                maker_bps: 0,
                taker_bps: 0,
            }),
            vec![btc_usdt()],
            log.clone(),
        ));
        Fixture {
            recovery: Recovery::new(
                projector,
                log.clone(),
                prices.clone(),
                RecoveryConfig {
                    history_window: 100,
                },
            ),
            store,
            log,
            prices,
            sequencer,
        }
    }

    fn limit(id: u64, status: OrderStatus) -> Order {
        let mut order = Order::new(
            id,
            AccountKey::new(1, 0),
            "btcusdt",
            Side::Sell,
            OrderType::Limit,
            0,
        );
        order.price = 3_000_000;
        order.amount = 10_000;
        order.locked_funds = 10_000;
        order.status = status;
        order
    }

    #[tokio::test]
    async fn test_sequencer_seeded_from_sync_feed() {
        let f = fixture();
        f.store.insert_order(&limit(5, OrderStatus::Untouched)).await.unwrap();
        let sync = SyncRecord {
            market_id: "btcusdt".to_string(),
            seq_id: 3,
            order_ids: vec![42, 7],
            trade_ids: vec![11],
        };
        f.log
            .append(topics::SYNC_DATA, serde_json::to_vec(&sync).unwrap())
            .await
            .unwrap();

        f.recovery
            .seed_sequencer(&f.sequencer, &[btc_usdt()])
            .await
            .unwrap();
        assert_eq!(f.sequencer.last_order_id(), 42);
        assert_eq!(f.sequencer.last_trade_id(), 11);
        assert_eq!(f.sequencer.next_order_id(), 43);
    }

    #[tokio::test]
    async fn test_live_orders_restored_and_pending_resubmitted() {
        let f = fixture();
        f.store.insert_order(&limit(1, OrderStatus::Untouched)).await.unwrap();
        let mut partial = limit(2, OrderStatus::PartiallyFilled);
        partial.filled_amount = 4_000;
        f.store.insert_order(&partial).await.unwrap();
        f.store.insert_order(&limit(3, OrderStatus::Pending)).await.unwrap();
        f.store.insert_order(&limit(4, OrderStatus::Filled)).await.unwrap();

        let recovered = f
            .recovery
            .recover_market(&btc_usdt(), &EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(recovered.restored, 2);
        assert_eq!(recovered.engine.open_orders(), 2);
        assert_eq!(recovered.resubmit.len(), 1);
        assert_eq!(recovered.resubmit[0].order_id(), 3);
        assert!(recovered.caught_up.is_empty());

        let snapshot = recovered.engine.snapshot(10);
        assert_eq!(snapshot.asks.len(), 1);
        // 1.0000 + residual 0.6000 at one level
        assert_eq!(snapshot.asks[0].amount, 16_000);
        assert_eq!(f.prices.last_price("btcusdt"), None);
    }
}
