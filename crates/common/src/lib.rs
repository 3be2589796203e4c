//! Common types and utilities for SpotX
//!
//! This crate provides the shared vocabulary of the trading core: order
//! enums, account keys, market definitions and the fixed-point helpers
//! every other crate uses for monetary values.
//!
//! # Modules
//!
//! - [`decimal`] - Scaled-integer conversion and arithmetic
//! - [`error`] - Common error types
//! - [`types`] - Shared domain types (Side, OrderType, Market, etc.)

pub mod decimal;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
