//! In-memory order store implementation

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::store::traits::{OrderStore, ProjectionBatch};
use crate::types::{Order, OrderFilter, TradeRecord};
use crate::Result;

#[derive(Default)]
struct Tables {
    orders: HashMap<u64, Order>,
    trades: BTreeMap<u64, TradeRecord>,
    trade_keys: HashSet<(String, u64)>,
    watermarks: HashMap<String, u64>,
}

/// In-memory order store for testing and development
#[derive(Default)]
pub struct InMemoryOrderStore {
    tables: RwLock<Tables>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.tables.read().orders.len()
    }

    pub fn trade_count(&self) -> usize {
        self.tables.read().trades.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.tables.write().orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: u64) -> Result<Option<Order>> {
        Ok(self.tables.read().orders.get(&order_id).cloned())
    }

    async fn apply_projection(&self, batch: &ProjectionBatch) -> Result<()> {
        let mut tables = self.tables.write();

        for order in &batch.orders {
            tables.orders.insert(order.id, order.clone());
        }
        for trade in &batch.trades {
            if tables.trade_keys.insert((trade.market_id.clone(), trade.seqid)) {
                tables.trades.insert(trade.id, trade.clone());
            }
        }
        if let Some(seq) = batch.seq_id {
            let mark = tables.watermarks.entry(batch.market_id.clone()).or_insert(0);
            *mark = (*mark).max(seq);
        }
        Ok(())
    }

    async fn applied_seq(&self, market_id: &str) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .watermarks
            .get(market_id)
            .copied()
            .unwrap_or(0))
    }

    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .tables
            .read()
            .orders
            .values()
            .filter(|o| o.market_id == market_id && !o.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .tables
            .read()
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.id.cmp(&a.id));

        let (skip, take) = filter.window();
        Ok(orders.into_iter().skip(skip).take(take).collect())
    }

    async fn recent_trades(&self, market_id: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        Ok(self
            .tables
            .read()
            .trades
            .values()
            .rev()
            .filter(|t| t.market_id == market_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn max_ids(&self) -> Result<(u64, u64)> {
        let tables = self.tables.read();
        let order_id = tables.orders.keys().copied().max().unwrap_or(0);
        let trade_id = tables.trades.keys().next_back().copied().unwrap_or(0);
        Ok((order_id, trade_id))
    }

    async fn max_trade_seq(&self, market_id: &str) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .trades
            .values()
            .filter(|t| t.market_id == market_id)
            .map(|t| t.seqid)
            .max()
            .unwrap_or(0))
    }

    async fn last_trade_price(&self, market_id: &str) -> Result<Option<u64>> {
        Ok(self
            .tables
            .read()
            .trades
            .values()
            .filter(|t| t.market_id == market_id)
            .max_by_key(|t| t.seqid)
            .map(|t| t.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountKey, OrderStatus, OrderType, Side};

    fn order(id: u64, status: OrderStatus) -> Order {
        let mut order = Order::new(id, AccountKey::new(1, 0), "btcusdt", Side::Buy, OrderType::Limit, id as i64);
        order.status = status;
        order
    }

    fn trade(id: u64, seqid: u64, price: u64) -> TradeRecord {
        TradeRecord {
            id,
            market_id: "btcusdt".to_string(),
            seqid,
            price,
            volume: 1,
            quote_volume: price,
            taker_side: Side::Buy,
            maker_order_id: 1,
            taker_order_id: 2,
            maker_id: 1,
            maker_sub_account: 0,
            taker_id: 2,
            taker_sub_account: 0,
            maker_fee: 0,
            taker_fee: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_projection_is_idempotent_per_trade_seq() {
        let store = InMemoryOrderStore::new();
        let batch = ProjectionBatch {
            market_id: "btcusdt".to_string(),
            seq_id: Some(4),
            orders: vec![order(1, OrderStatus::PartiallyFilled)],
            trades: vec![trade(10, 1, 500)],
        };
        store.apply_projection(&batch).await.unwrap();

        // Same trade seq under a freshly allocated id
        let mut replay = batch.clone();
        replay.trades = vec![trade(11, 1, 500)];
        store.apply_projection(&replay).await.unwrap();

        assert_eq!(store.trade_count(), 1);
        assert_eq!(store.applied_seq("btcusdt").await.unwrap(), 4);
        assert_eq!(store.max_ids().await.unwrap(), (1, 10));
    }

    #[tokio::test]
    async fn test_synthetic_batch_keeps_watermark() {
        let store = InMemoryOrderStore::new();
        store
            .apply_projection(&ProjectionBatch {
                market_id: "btcusdt".to_string(),
                seq_id: Some(9),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .apply_projection(&ProjectionBatch {
                market_id: "btcusdt".to_string(),
                seq_id: None,
                orders: vec![order(3, OrderStatus::Cancelled)],
                trades: vec![],
            })
            .await
            .unwrap();

        assert_eq!(store.applied_seq("btcusdt").await.unwrap(), 9);
        assert_eq!(store.applied_seq("ethusdt").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_orders_and_listing() {
        let store = InMemoryOrderStore::new();
        for (id, status) in [
            (1, OrderStatus::Untouched),
            (2, OrderStatus::Filled),
            (3, OrderStatus::Pending),
        ] {
            store.insert_order(&order(id, status)).await.unwrap();
        }

        let open: Vec<u64> = store
            .open_orders("btcusdt")
            .await
            .unwrap()
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(open, vec![1, 3]);

        let page = store
            .list_orders(&OrderFilter {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|o| o.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_trade_queries() {
        let store = InMemoryOrderStore::new();
        store
            .apply_projection(&ProjectionBatch {
                market_id: "btcusdt".to_string(),
                seq_id: Some(2),
                orders: vec![],
                trades: vec![trade(1, 1, 100), trade(2, 2, 105)],
            })
            .await
            .unwrap();

        assert_eq!(store.last_trade_price("btcusdt").await.unwrap(), Some(105));
        assert_eq!(store.last_trade_price("ethusdt").await.unwrap(), None);
        assert_eq!(store.max_trade_seq("btcusdt").await.unwrap(), 2);
        let recent = store.recent_trades("btcusdt", 1).await.unwrap();
        assert_eq!(recent[0].id, 2);
    }
}
