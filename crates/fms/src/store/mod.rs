//! Liability store: persistence for the ledger
//!
//! Implementations must insert a batch atomically and skip rows whose
//! dedup key already exists, so replaying an operation is harmless.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::ledger::LiabilityRow;
use crate::Result;

pub use memory::InMemoryLiabilityStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLiabilityStore;

#[async_trait]
pub trait LiabilityStore: Send + Sync {
    /// Append `rows` in one transaction; returns the number of new rows
    async fn append(&self, rows: &[LiabilityRow]) -> Result<usize>;

    /// Every row, in insertion order
    async fn load_all(&self) -> Result<Vec<LiabilityRow>>;
}
