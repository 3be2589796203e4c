//! OrderStore trait definition

use async_trait::async_trait;

use crate::types::{Order, OrderFilter, TradeRecord};
use crate::Result;

/// Row changes produced by projecting one engine event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionBatch {
    pub market_id: String,
    /// Engine seq the batch applies; `None` for synthetic events
    pub seq_id: Option<u64>,
    pub orders: Vec<Order>,
    pub trades: Vec<TradeRecord>,
}

/// OrderStore trait - persistent orders, trades and projection watermarks
///
/// This trait allows different storage implementations (in-memory, PostgreSQL)
/// to be swapped without changing the projection logic.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or overwrite an order row
    ///
    /// # Arguments
    /// * `order` - The order to write
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Get an order by ID
    ///
    /// # Returns
    /// The order if found, None otherwise
    async fn get_order(&self, order_id: u64) -> Result<Option<Order>>;

    /// Apply a projection batch atomically
    ///
    /// Orders are upserted, trades inserted unless their `(market_id, seqid)`
    /// already exists, and the market's watermark is raised to `seq_id`.
    /// Either all of it is visible afterwards or none of it.
    ///
    /// # Arguments
    /// * `batch` - The rows produced by one event
    async fn apply_projection(&self, batch: &ProjectionBatch) -> Result<()>;

    /// Highest engine seq applied for a market (0 when none)
    async fn applied_seq(&self, market_id: &str) -> Result<u64>;

    /// Non-terminal orders of a market, oldest first
    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>>;

    /// List orders, newest first
    ///
    /// # Arguments
    /// * `filter` - Owner, market, status, side, time range and paging
    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;

    /// Last `limit` trades of a market, newest first
    async fn recent_trades(&self, market_id: &str, limit: usize) -> Result<Vec<TradeRecord>>;

    /// Highest persisted `(order_id, trade_id)`
    async fn max_ids(&self) -> Result<(u64, u64)>;

    /// Highest persisted trade seq of a market
    async fn max_trade_seq(&self, market_id: &str) -> Result<u64>;

    /// Price of the most recent trade of a market
    async fn last_trade_price(&self, market_id: &str) -> Result<Option<u64>>;
}
