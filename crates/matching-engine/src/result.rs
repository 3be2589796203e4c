//! Result types for matching operations

use crate::domain::BookOrder;
use crate::event::CancelFailReason;

/// One maker fill produced while matching a taker
#[derive(Debug, Clone)]
pub struct Fill {
    /// Maker state after the fill
    pub maker: BookOrder,
    pub price: u64,
    pub volume: u64,
    pub quote_volume: u64,
}

impl Fill {
    pub fn maker_done(&self) -> bool {
        self.maker.is_filled()
    }
}

/// Result of a cancel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Order was live and has been removed
    Cancelled { filled_amount: u64, used_funds: u64 },
    /// Order could not be cancelled
    Failed(CancelFailReason),
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled { .. })
    }
}
