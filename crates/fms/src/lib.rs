//! Funds Management Service for SpotX
//!
//! Balance cells per `(user, sub_account, coin)` backed by an append-only
//! liability ledger. The ledger is authoritative; cells are rebuilt from it
//! on startup.
//!
//! # Modules
//!
//! - [`ledger`] - Liability rows and their dedup key
//! - [`manager`] - [`FundsManager`] and its lock/unlock/settle primitives
//! - [`store`] - Ledger persistence (memory, Postgres)

pub mod error;
pub mod ledger;
pub mod manager;
pub mod store;

pub use error::{FundsError, Result};
pub use ledger::{Account, LedgerOp, LedgerRef, LiabilityRow, RefType};
pub use manager::{BalanceCell, FundsManager, TradeSettlement};
pub use store::{InMemoryLiabilityStore, LiabilityStore};
#[cfg(feature = "postgres")]
pub use store::PostgresLiabilityStore;
