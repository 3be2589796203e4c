//! Per-market engine task
//!
//! The runner owns the [`MarketEngine`] for one market. It consumes a bounded
//! command channel, hands each command's events to the dispatcher as one
//! batch, and publishes a depth snapshot after every command. The live book
//! never leaves this task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use observability::{CommandTimer, MarketMetrics};

use crate::command::Command;
use crate::domain::OrderBookSnapshot;
use crate::engine::MarketEngine;
use crate::error::MatchingError;
use crate::event::EngineEvent;
use crate::Result;

/// Channels and flags shared between a runner and the rest of the process
pub struct RunnerLinks {
    pub commands: mpsc::Receiver<Command>,
    pub events: mpsc::Sender<Vec<EngineEvent>>,
    pub depth: watch::Sender<OrderBookSnapshot>,
    /// Set by the runner on fatal errors and by the dispatcher on
    /// projection failure; a halted runner stops consuming
    pub halted: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

pub struct EngineRunner {
    engine: MarketEngine,
    links: RunnerLinks,
    depth_levels: usize,
    metrics: MarketMetrics,
}

impl EngineRunner {
    pub fn new(engine: MarketEngine, links: RunnerLinks, depth_levels: usize) -> Self {
        let metrics = MarketMetrics::new(engine.market_id());
        Self {
            engine,
            links,
            depth_levels,
            metrics,
        }
    }

    /// Run until shutdown, a closed command channel or a fatal error
    pub async fn run(mut self) -> Result<()> {
        let market = self.engine.market_id().to_string();
        info!(
            market = %market,
            event_seq = self.engine.event_seq(),
            open_orders = self.engine.open_orders(),
            "Market engine started"
        );
        self.publish_depth();
        self.metrics.set_halted(false);

        loop {
            let command = tokio::select! {
                biased;
                _ = self.links.shutdown.cancelled() => {
                    info!(market = %market, "Market engine shutting down");
                    break;
                }
                command = self.links.commands.recv() => match command {
                    Some(command) => command,
                    None => {
                        info!(market = %market, "Command channel closed");
                        break;
                    }
                },
            };

            if self.links.halted.load(Ordering::SeqCst) {
                warn!(market = %market, order_id = command.order_id(), "Market halted, engine stopping");
                self.metrics.set_halted(true);
                break;
            }

            let events = match self.step(command) {
                Ok(events) => events,
                Err(e) => {
                    error!(market = %market, error = %e, "Fatal engine error, halting market");
                    self.links.halted.store(true, Ordering::SeqCst);
                    self.metrics.set_halted(true);
                    return Err(e);
                }
            };

            if self.links.events.send(events).await.is_err() {
                self.links.halted.store(true, Ordering::SeqCst);
                self.metrics.set_halted(true);
                return Err(MatchingError::ChannelClosed(market));
            }
        }
        Ok(())
    }

    fn step(&mut self, command: Command) -> Result<Vec<EngineEvent>> {
        let mut timer = CommandTimer::new(&self.metrics);
        let events = self.engine.process(command, common::now_nanos())?;
        let trades = events.iter().filter(|e| e.trade().is_some()).count();
        timer.set_output(events.len(), trades);
        drop(timer);

        self.metrics.set_book_orders(self.engine.open_orders());
        self.publish_depth();
        Ok(events)
    }

    fn publish_depth(&self) {
        self.links
            .depth
            .send_replace(self.engine.snapshot(self.depth_levels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OrderCommand;
    use crate::event::EventKind;
    use common::{OrderType, Side};

    struct Harness {
        commands: mpsc::Sender<Command>,
        events: mpsc::Receiver<Vec<EngineEvent>>,
        depth: watch::Receiver<OrderBookSnapshot>,
        halted: Arc<AtomicBool>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn spawn() -> Harness {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (depth_tx, depth_rx) = watch::channel(OrderBookSnapshot::empty("btcusdt"));
        let halted = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let runner = EngineRunner::new(
            MarketEngine::new("btcusdt", 4, 100),
            RunnerLinks {
                commands: command_rx,
                events: event_tx,
                depth: depth_tx,
                halted: halted.clone(),
                shutdown: shutdown.clone(),
            },
            10,
        );

        Harness {
            commands: command_tx,
            events: event_rx,
            depth: depth_rx,
            halted,
            shutdown,
            task: tokio::spawn(runner.run()),
        }
    }

    fn sell(id: u64, price: u64) -> Command {
        let mut order = OrderCommand::new(id, 1, 0, "btcusdt", Side::Sell, OrderType::Limit);
        order.price = price;
        order.amount = 1_000;
        Command::NewOrder(order)
    }

    #[tokio::test]
    async fn test_runner_emits_batches_and_depth() {
        let mut h = spawn();

        h.commands.send(sell(1, 10_000)).await.unwrap();
        let batch = h.events.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0].kind, EventKind::OrderAccepted { order_id: 1, .. }));

        let snapshot = h.depth.borrow().clone();
        assert_eq!(snapshot.asks.len(), 1);
        assert_eq!(snapshot.asks[0].price, 10_000);

        h.shutdown.cancel();
        assert!(h.task.await.unwrap().is_ok());
        assert!(!h.halted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fatal_error_halts_market() {
        let h = spawn();

        h.commands.send(sell(1, 10_000)).await.unwrap();
        h.commands.send(sell(1, 10_000)).await.unwrap();

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(MatchingError::DuplicateOrder(1))));
        assert!(h.halted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_externally_halted_runner_stops() {
        let h = spawn();
        h.halted.store(true, Ordering::SeqCst);

        h.commands.send(sell(1, 10_000)).await.unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }
}
