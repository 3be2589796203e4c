//! Durable storage plumbing for SpotX
//!
//! - [`log`] - Append-only, per-topic durable log (in-memory or Redis Streams)
//! - [`topics`] - Topic naming shared by producers and consumers
//! - [`positions`] - Consumer queue positions (`load` / `save`)
//! - [`postgres`] - Pool, migrations and catalog sync (feature `postgres`)

pub mod error;
pub mod log;
pub mod positions;
pub mod topics;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StorageError;
pub use log::{create_log, DurableLog, InMemoryLog, LogRecord, LogType, RedisStreamLog, SharedLog};
pub use positions::{InMemoryPositionStore, PositionStore};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
