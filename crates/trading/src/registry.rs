//! Running markets
//!
//! A [`MarketHandle`] is everything outside the engine task needs to talk
//! to one market: the command channel, the depth snapshot and the halt
//! flag. The book itself is never reachable from here.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use common::Market;
use matching_engine::{Command, OrderBookSnapshot};
use observability::MarketMetrics;
use storage::{topics, SharedLog};

use crate::error::TradingError;
use crate::Result;

pub struct MarketHandle {
    market: Market,
    commands: mpsc::Sender<Command>,
    depth: watch::Receiver<OrderBookSnapshot>,
    halted: Arc<AtomicBool>,
    log: SharedLog,
}

impl MarketHandle {
    pub fn new(
        market: Market,
        commands: mpsc::Sender<Command>,
        depth: watch::Receiver<OrderBookSnapshot>,
        halted: Arc<AtomicBool>,
        log: SharedLog,
    ) -> Self {
        Self {
            market,
            commands,
            depth,
            halted,
            log,
        }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop the market; the engine exits on its next command
    pub fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(market = %self.market.id, reason, "Market halted");
            MarketMetrics::new(&self.market.id).set_halted(true);
        }
    }

    /// Latest depth snapshot published by the engine
    pub fn depth(&self) -> OrderBookSnapshot {
        self.depth.borrow().clone()
    }

    /// Record a command on `orders.<market>` and hand it to the engine
    pub async fn submit(&self, command: Command) -> Result<()> {
        self.submit_all(vec![command]).await.map_err(|f| f.error)
    }

    /// Record every command before the engine sees the first one
    ///
    /// Legs of one container either all reach the log or none reach the
    /// engine. A failure while handing them over reports how many the
    /// engine already holds.
    pub async fn submit_all(
        &self,
        commands: Vec<Command>,
    ) -> std::result::Result<(), SubmitFailure> {
        if self.is_halted() {
            return Err(TradingError::MarketHalted(self.market.id.clone()).into());
        }

        let topic = topics::orders(&self.market.id);
        for command in &commands {
            let payload = command.encode().map_err(TradingError::from)?;
            let offset = self
                .log
                .append(&topic, payload)
                .await
                .map_err(TradingError::from)?;
            debug!(
                market = %self.market.id,
                kind = command.kind(),
                order_id = command.order_id(),
                offset,
                "Command logged"
            );
        }

        for (sent, command) in commands.into_iter().enumerate() {
            if self.commands.send(command).await.is_err() {
                return Err(SubmitFailure {
                    sent,
                    error: TradingError::EngineUnavailable(self.market.id.clone()),
                });
            }
        }
        Ok(())
    }
}

/// [`MarketHandle::submit_all`] stopped part-way
#[derive(Debug, thiserror::Error)]
#[error("{error} ({sent} command(s) already with the engine)")]
pub struct SubmitFailure {
    /// Leading commands the engine received
    pub sent: usize,
    pub error: TradingError,
}

impl From<TradingError> for SubmitFailure {
    fn from(error: TradingError) -> Self {
        Self { sent: 0, error }
    }
}

/// Markets with a running engine
#[derive(Default)]
pub struct MarketRegistry {
    markets: RwLock<HashMap<String, Arc<MarketHandle>>>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: MarketHandle) -> Arc<MarketHandle> {
        let handle = Arc::new(handle);
        self.markets
            .write()
            .insert(handle.market.id.clone(), handle.clone());
        handle
    }

    pub fn get(&self, market_id: &str) -> Option<Arc<MarketHandle>> {
        self.markets.read().get(market_id).cloned()
    }

    /// Running market ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.markets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn halted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .markets
            .read()
            .values()
            .filter(|h| h.is_halted())
            .map(|h| h.market.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
