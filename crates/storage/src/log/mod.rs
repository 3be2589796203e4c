//! Durable log
//!
//! Partitioned, append-only topics. Every record gets a dense per-topic
//! offset starting at 0; consumers track the next offset they need and
//! recovery reads the tail of a topic.

mod memory;
mod redis_streams;

pub use redis_streams::RedisStreamLog;
pub use memory::InMemoryLog;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::StorageError;
use crate::Result;

/// One record read back from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Append-only topic log
///
/// Appends to one topic are totally ordered. Implementations must not
/// reorder records, and offsets never decrease.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a record and return its offset.
    async fn append(&self, topic: &str, payload: Vec<u8>) -> Result<u64>;

    /// Records with `offset >= from`, oldest first, at most `max`.
    async fn read(&self, topic: &str, from: u64, max: usize) -> Result<Vec<LogRecord>>;

    /// The newest `max` records, newest first.
    async fn read_tail(&self, topic: &str, max: usize) -> Result<Vec<LogRecord>>;

    /// Offset of the newest record, if any.
    async fn latest_offset(&self, topic: &str) -> Result<Option<u64>>;
}

pub type SharedLog = Arc<dyn DurableLog>;

/// Log backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    InMemory,
    Redis,
}

impl std::str::FromStr for LogType {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inmemory" | "in_memory" | "memory" => Ok(LogType::InMemory),
            "redis" => Ok(LogType::Redis),
            other => Err(StorageError::Config(format!("unknown log type '{}'", other))),
        }
    }
}

/// Create the log backend described by configuration
pub async fn create_log(config: &config::LogConfig) -> Result<SharedLog> {
    match config.log_type.parse::<LogType>()? {
        LogType::InMemory => {
            info!("Creating in-memory durable log");
            Ok(Arc::new(InMemoryLog::new()))
        }
        LogType::Redis => {
            let redis = config.redis.as_ref().ok_or_else(|| {
                StorageError::Config("redis configuration required for redis log".to_string())
            })?;
            info!("Creating Redis Streams durable log");
            Ok(Arc::new(RedisStreamLog::connect(redis).await?))
        }
    }
}
