//! Order Management System for SpotX
//!
//! The authoritative view of every order: live orders in memory, all orders
//! and trades in the order store, and the projector that folds engine events
//! into both while settling funds through FMS.
//!
//! # Modules
//!
//! - [`types`] - Orders, trade records, listing filters
//! - [`manager`] - In-memory index of live orders
//! - [`sequencer`] - Global order and trade id allocation
//! - [`fees`] - Maker/taker fee schedule
//! - [`projector`] - Engine event projection
//! - [`store`] - Order/trade persistence (memory, Postgres)

pub mod error;
pub mod fees;
pub mod manager;
pub mod projector;
pub mod sequencer;
pub mod store;
pub mod types;

pub use error::{OmsError, Result};
pub use fees::{FeeRates, FeeSchedule};
pub use manager::OrderManager;
pub use projector::{OrderChange, Projection, Projector};
pub use sequencer::Sequencer;
pub use store::{InMemoryOrderStore, OrderStore, ProjectionBatch};
#[cfg(feature = "postgres")]
pub use store::PostgresOrderStore;
pub use types::{claim_for, Order, OrderFilter, StatusFilter, SyncRecord, TradeRecord};
