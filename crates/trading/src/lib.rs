//! Trading runtime for SpotX
//!
//! Ties the matching engines, OMS and FMS into a running exchange:
//!
//! - [`intake`]: validates, locks and publishes new orders
//! - [`dispatcher`]: logs and projects engine events per market
//! - [`cancel`]: synchronous cancellation over the asynchronous engine
//! - [`orchestrator`]: OCO, OTO and straddle/strangle coupling
//! - [`recovery`]: rebuilds books and id counters on startup
//! - [`wallet`]: deposits and withdrawals from the wallet service
//! - [`api`]: the HTTP surface

pub mod api;
pub mod cancel;
pub mod dispatcher;
pub mod error;
pub mod exchange;
pub mod intake;
pub mod orchestrator;
pub mod price_feed;
pub mod recovery;
pub mod registry;
pub mod wallet;

pub use cancel::{CancelOutcome, CancelPolicy, CancelRouter, CancelService};
pub use error::{ErrorKind, Result, TradingError};
pub use exchange::{Backends, Exchange};
pub use intake::{OrderIntake, OrderRequest};
pub use orchestrator::Orchestrator;
pub use price_feed::{LastPriceCache, PriceFeed};
pub use registry::{MarketHandle, MarketRegistry, SubmitFailure};
pub use wallet::{WalletBridge, WalletCommand, WalletEvent};
