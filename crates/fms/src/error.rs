//! FMS error types

use thiserror::Error;

use common::AccountKey;
use storage::StorageError;

/// Errors that can occur in the funds management service
#[derive(Error, Debug)]
pub enum FundsError {
    /// A debit would take a balance below zero
    #[error("Insufficient funds: {account} needs {required} {coin}, has {available}")]
    InsufficientFunds {
        account: AccountKey,
        coin: String,
        required: u64,
        available: u64,
    },

    /// Malformed request (zero amount, fee above amount, self transfer)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Ledger contents that cannot describe a valid balance
    #[error("Ledger corrupt: {0}")]
    Corrupt(String),

    /// Liability store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FundsError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether the operation may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, FundsError::Storage(e) if e.is_transient())
    }
}

/// Result type for FMS operations
pub type Result<T> = std::result::Result<T, FundsError>;
