//! HTTP API for trading
//!
//! Callers are identified by the `X-User-Id` and `X-Sub-Account` headers
//! set by the gateway in front of this service.

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::{Caller, TradingApiState};
pub use routes::{create_api_state, create_router};
