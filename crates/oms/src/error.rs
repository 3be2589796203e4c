//! OMS error types

use fms::FundsError;
use storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the Order Management System
#[derive(Error, Debug)]
pub enum OmsError {
    /// Invalid order
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Order not found
    #[error("Order not found: {0}")]
    NotFound(u64),

    /// Market not configured in this process
    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    /// An event arrived out of sequence for its market
    #[error("Projection corruption on {market}: expected seq {expected}, got {got}")]
    ProjectionCorruption {
        market: String,
        expected: u64,
        got: u64,
    },

    /// Funds operation failed
    #[error(transparent)]
    Funds(#[from] FundsError),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Scaled arithmetic failed
    #[error(transparent)]
    Arithmetic(#[from] common::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OmsError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOrder(msg.into())
    }

    /// Whether retrying the same projection may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OmsError::Storage(e) => e.is_transient(),
            OmsError::Funds(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for OMS operations
pub type Result<T> = std::result::Result<T, OmsError>;
