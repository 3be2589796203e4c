//! Observability infrastructure for SpotX
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics
//! - Metric sets for market engines and the trading pipeline
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("spotx", LogFormat::Pretty, "info")?;
//! observability::metrics::init_metrics(9090)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, CommandTimer, MarketMetrics, TradingMetrics};
