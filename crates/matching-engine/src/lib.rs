//! Order Matching Engine for SpotX
//!
//! One deterministic engine per market: a price-time priority book, dormant
//! stop and trailing-stop orders, and the binary command/event types that
//! travel on the durable log.
//!
//! # Modules
//!
//! - [`command`] - Engine input (`orders.<market>`)
//! - [`event`] - Engine output (`events.<market>`)
//! - [`domain`] - Book orders, the order book, depth snapshots
//! - [`stops`] - Stop and trailing-stop books
//! - [`engine`] - The matching engine
//! - [`runner`] - Per-market task around the engine

pub mod command;
pub mod domain;
pub mod engine;
pub mod error;
pub mod event;
pub mod result;
pub mod runner;
pub mod stops;

pub use command::{CancelCommand, Command, OrderCommand};
pub use domain::{BookOrder, OrderBook, OrderBookSnapshot, PriceLevel};
pub use engine::MarketEngine;
pub use error::MatchingError;
pub use event::{CancelFailReason, EngineEvent, EventKind, Trade};
pub use runner::{EngineRunner, RunnerLinks};

/// Result type for matching operations
pub type Result<T> = std::result::Result<T, MatchingError>;
