//! Trading runtime error types

use thiserror::Error;

use fms::FundsError;
use matching_engine::MatchingError;
use oms::OmsError;
use storage::StorageError;

/// Errors surfaced by intake, cancellation and the runtime
#[derive(Error, Debug)]
pub enum TradingError {
    /// Malformed or out-of-range request
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Market not configured
    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    /// Market configured but not open for trading
    #[error("Market disabled: {0}")]
    MarketDisabled(String),

    /// Market stopped after a fatal error; needs a restart
    #[error("Market halted: {0}")]
    MarketHalted(String),

    /// Order missing or owned by someone else
    #[error("Order not found: {0}")]
    NotFound(u64),

    /// Engine input channel closed
    #[error("Engine unavailable for {0}")]
    EngineUnavailable(String),

    #[error(transparent)]
    Funds(#[from] FundsError),

    #[error(transparent)]
    Oms(#[from] OmsError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] MatchingError),

    #[error(transparent)]
    Arithmetic(#[from] common::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InsufficientFunds,
    NotFound,
    Unavailable,
    TransientStorage,
    ProjectionCorruption,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unavailable => "MARKET_UNAVAILABLE",
            ErrorKind::TransientStorage => "STORAGE_UNAVAILABLE",
            ErrorKind::ProjectionCorruption => "PROJECTION_CORRUPTION",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

fn storage_kind(e: &StorageError) -> ErrorKind {
    if e.is_transient() {
        ErrorKind::TransientStorage
    } else {
        ErrorKind::Internal
    }
}

fn funds_kind(e: &FundsError) -> ErrorKind {
    match e {
        FundsError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
        FundsError::InvalidRequest(_) => ErrorKind::Validation,
        FundsError::Corrupt(_) => ErrorKind::Internal,
        FundsError::Storage(e) => storage_kind(e),
    }
}

impl TradingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TradingError::Validation(_)
            | TradingError::UnknownMarket(_)
            | TradingError::Arithmetic(_) => ErrorKind::Validation,
            TradingError::MarketDisabled(_)
            | TradingError::MarketHalted(_)
            | TradingError::EngineUnavailable(_) => ErrorKind::Unavailable,
            TradingError::NotFound(_) => ErrorKind::NotFound,
            TradingError::Funds(e) => funds_kind(e),
            TradingError::Storage(e) => storage_kind(e),
            TradingError::Oms(e) => match e {
                OmsError::InvalidOrder(_) | OmsError::UnknownMarket(_) | OmsError::Arithmetic(_) => {
                    ErrorKind::Validation
                }
                OmsError::NotFound(_) => ErrorKind::NotFound,
                OmsError::ProjectionCorruption { .. } => ErrorKind::ProjectionCorruption,
                OmsError::Funds(e) => funds_kind(e),
                OmsError::Storage(e) => storage_kind(e),
                OmsError::Internal(_) => ErrorKind::Internal,
            },
            TradingError::Engine(_) | TradingError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for trading operations
pub type Result<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::AccountKey;

    #[test]
    fn test_error_kinds() {
        let insufficient = TradingError::Funds(FundsError::InsufficientFunds {
            account: AccountKey::new(1, 0),
            coin: "USDT".to_string(),
            required: 10,
            available: 5,
        });
        assert_eq!(insufficient.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(insufficient.kind().code(), "INSUFFICIENT_FUNDS");

        let nested = TradingError::Oms(OmsError::Funds(FundsError::Storage(
            StorageError::Connection("reset".to_string()),
        )));
        assert_eq!(nested.kind(), ErrorKind::TransientStorage);

        assert_eq!(
            TradingError::MarketHalted("btcusdt".to_string()).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(TradingError::NotFound(3).kind(), ErrorKind::NotFound);
        assert_eq!(
            TradingError::Oms(OmsError::ProjectionCorruption {
                market: "btcusdt".to_string(),
                expected: 2,
                got: 4,
            })
            .kind(),
            ErrorKind::ProjectionCorruption
        );
    }
}
