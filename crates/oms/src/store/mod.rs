//! Order and trade persistence
//!
//! - [`traits`] - The [`OrderStore`] interface and [`ProjectionBatch`]
//! - [`memory`] - In-memory store for tests and single-process runs
//! - [`postgres`] - PostgreSQL store (feature `postgres`)

pub mod memory;
pub mod traits;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryOrderStore;
pub use traits::{OrderStore, ProjectionBatch};

#[cfg(feature = "postgres")]
pub use postgres::PostgresOrderStore;
