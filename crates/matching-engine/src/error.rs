//! Matching engine error types
//!
//! Every variant is fatal for the market that raised it: the runner halts
//! and the book is rebuilt from storage on restart. Cancel refusals are not
//! errors, they are reported as `OrderCancelFailed` events.

use thiserror::Error;

/// Errors that can occur during order matching
#[derive(Error, Debug)]
pub enum MatchingError {
    /// Command failed structural validation
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// An order id that is already live or recently terminated
    #[error("Duplicate order id: {0}")]
    DuplicateOrder(u64),

    /// Command addressed to another market
    #[error("Command for market {got} sent to engine {expected}")]
    WrongMarket { expected: String, got: String },

    /// Scaled arithmetic left the representable range
    #[error("Arithmetic error: {0}")]
    Arithmetic(#[from] common::Error),

    /// Binary encoding of a command or event failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Output channel closed while the engine was running
    #[error("Engine channel closed: {0}")]
    ChannelClosed(String),
}

impl MatchingError {
    pub fn invalid_order(msg: impl Into<String>) -> Self {
        Self::InvalidOrder(msg.into())
    }
}

impl From<bincode::Error> for MatchingError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
