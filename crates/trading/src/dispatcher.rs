//! Engine event fan-out
//!
//! One dispatcher per market consumes the engine's event batches in order.
//! For every event it:
//!
//! 1. appends it to `events.<market>`
//! 2. projects it (orders, trades, funds)
//! 3. feeds the last-price cache from trades
//! 4. completes cancel waiters
//! 5. hands the projection to the orchestrator
//!
//! CRITICAL PROPERTIES:
//! - Events of a market are projected strictly in `seq_id` order
//! - Waiters complete only after the projection committed
//! - Corruption or exhausted retries halt the market; nothing after the
//!   failing event is projected

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use config::EngineConfig;
use matching_engine::EngineEvent;
use observability::TradingMetrics;
use oms::{OmsError, Projection, Projector};
use storage::{topics, SharedLog};

use crate::cancel::CancelRouter;
use crate::orchestrator::Orchestrator;
use crate::price_feed::LastPriceCache;
use crate::registry::MarketHandle;

/// Retry policy for transient projection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retries: config.projection_retries,
            backoff: Duration::from_millis(config.projection_backoff_ms),
        }
    }
}

/// Components every market's dispatcher feeds
#[derive(Clone)]
pub struct Pipeline {
    pub projector: Arc<Projector>,
    pub router: Arc<CancelRouter>,
    pub prices: Arc<LastPriceCache>,
    pub orchestrator: Arc<Orchestrator>,
    pub log: SharedLog,
    pub retry: RetryPolicy,
}

pub struct Dispatcher {
    handle: Arc<MarketHandle>,
    events: mpsc::Receiver<Vec<EngineEvent>>,
    pipeline: Pipeline,
    metrics: TradingMetrics,
}

impl Dispatcher {
    pub fn new(
        handle: Arc<MarketHandle>,
        events: mpsc::Receiver<Vec<EngineEvent>>,
        pipeline: Pipeline,
    ) -> Self {
        let metrics = TradingMetrics::new(&handle.market().id);
        Self {
            handle,
            events,
            pipeline,
            metrics,
        }
    }

    /// Run until shutdown, the engine closes its channel or the market halts
    pub async fn run(mut self, shutdown: CancellationToken) {
        let market = self.handle.market().id.clone();
        info!(market = %market, "Event dispatcher started");

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self.events.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        info!(market = %market, "Engine event channel closed");
                        break;
                    }
                },
            };

            for event in batch {
                if let Err(reason) = self.dispatch(&event).await {
                    self.handle.halt(&reason);
                    error!(
                        market = %market,
                        seq_id = event.seq_id,
                        reason = %reason,
                        "Dispatcher stopped"
                    );
                    return;
                }
            }
        }
        info!(market = %market, "Event dispatcher stopped");
    }

    /// Process one event; `Err` carries the halt reason
    pub async fn dispatch(&self, event: &EngineEvent) -> Result<(), String> {
        self.append(event).await?;

        let started = Instant::now();
        let projection = self.project(event).await?;
        if projection.duplicate {
            self.metrics.record_duplicate();
            debug!(market = %event.market_id, seq_id = event.seq_id, "Duplicate event");
        } else {
            self.metrics.record_projection(started.elapsed());
        }

        if let Some(trade) = event.trade() {
            self.pipeline.prices.update(&event.market_id, trade.price);
        }
        self.pipeline.router.on_event(event);
        self.pipeline.orchestrator.observe(projection);
        Ok(())
    }

    async fn append(&self, event: &EngineEvent) -> Result<(), String> {
        let payload = event
            .encode()
            .map_err(|e| format!("event {} not encodable: {}", event.seq_id, e))?;
        let topic = topics::events(&event.market_id);

        let mut attempt = 0;
        loop {
            match self.pipeline.log.append(&topic, payload.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.pipeline.retry.retries => {
                    attempt += 1;
                    warn!(market = %event.market_id, seq_id = event.seq_id, attempt, error = %e, "Event append failed, retrying");
                    tokio::time::sleep(self.pipeline.retry.backoff).await;
                }
                Err(e) => return Err(format!("event {} not logged: {}", event.seq_id, e)),
            }
        }
    }

    async fn project(&self, event: &EngineEvent) -> Result<Projection, String> {
        let mut attempt = 0;
        loop {
            match self.pipeline.projector.project(event).await {
                Ok(projection) => return Ok(projection),
                Err(e) if e.is_transient() && attempt < self.pipeline.retry.retries => {
                    attempt += 1;
                    warn!(
                        market = %event.market_id,
                        seq_id = event.seq_id,
                        attempt,
                        error = %e,
                        "Projection failed, retrying"
                    );
                    // The store may have committed before reporting the failure
                    self.pipeline
                        .projector
                        .reset_watermark(&event.market_id)
                        .await;
                    tokio::time::sleep(self.pipeline.retry.backoff).await;
                }
                Err(e @ OmsError::ProjectionCorruption { .. }) => {
                    return Err(format!("projection corruption: {}", e));
                }
                Err(e) => return Err(format!("projection of event {} failed: {}", event.seq_id, e)),
            }
        }
    }
}
