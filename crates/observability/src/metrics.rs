//! Prometheus metrics infrastructure
//!
//! Metric sets for the per-market engines and the trading pipeline that
//! sits behind them. Handles are created once per market and cloned into
//! the tasks that record them.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Initialize the Prometheus metrics exporter
///
/// This starts an HTTP server on the specified port that exposes metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Per-market engine metrics
///
/// # Metrics
///
/// * `engine_commands_total` - Commands processed
/// * `engine_events_total` - Events emitted
/// * `engine_trades_total` - Trades executed
/// * `engine_command_duration_seconds` - Time spent matching one command
/// * `engine_book_orders` - Resting orders in the book
/// * `engine_halted` - 1 while the market is halted
#[derive(Clone)]
pub struct MarketMetrics {
    commands_total: Counter,
    events_total: Counter,
    trades_total: Counter,
    command_duration: Histogram,
    book_orders: Gauge,
    halted: Gauge,
    market: String,
}

impl MarketMetrics {
    pub fn new(market: &str) -> Self {
        let name = market.to_string();

        Self {
            commands_total: counter!("engine_commands_total", "market" => name.clone()),
            events_total: counter!("engine_events_total", "market" => name.clone()),
            trades_total: counter!("engine_trades_total", "market" => name.clone()),
            command_duration: histogram!("engine_command_duration_seconds", "market" => name.clone()),
            book_orders: gauge!("engine_book_orders", "market" => name.clone()),
            halted: gauge!("engine_halted", "market" => name.clone()),
            market: name,
        }
    }

    /// Record one processed command and what it produced
    pub fn record_command(&self, duration: Duration, events: usize, trades: usize) {
        self.commands_total.increment(1);
        self.events_total.increment(events as u64);
        self.trades_total.increment(trades as u64);
        self.command_duration.record(duration.as_secs_f64());
    }

    pub fn set_book_orders(&self, count: usize) {
        self.book_orders.set(count as f64);
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.set(if halted { 1.0 } else { 0.0 });
    }

    pub fn market(&self) -> &str {
        &self.market
    }
}

/// Trading pipeline metrics for one market
///
/// * `projection_events_total` - Events applied by the projector
/// * `projection_duplicates_total` - Events skipped as already applied
/// * `projection_duration_seconds` - Time to project one event
/// * `cancel_outcomes_total` - Cancel requests by outcome
/// * `compensations_total` - Compensating local cancellations
#[derive(Clone)]
pub struct TradingMetrics {
    projected: Counter,
    duplicates: Counter,
    projection_duration: Histogram,
    compensations: Counter,
    market: String,
}

impl TradingMetrics {
    pub fn new(market: &str) -> Self {
        let name = market.to_string();

        Self {
            projected: counter!("projection_events_total", "market" => name.clone()),
            duplicates: counter!("projection_duplicates_total", "market" => name.clone()),
            projection_duration: histogram!("projection_duration_seconds", "market" => name.clone()),
            compensations: counter!("compensations_total", "market" => name.clone()),
            market: name,
        }
    }

    pub fn record_projection(&self, duration: Duration) {
        self.projected.increment(1);
        self.projection_duration.record(duration.as_secs_f64());
    }

    pub fn record_duplicate(&self) {
        self.duplicates.increment(1);
    }

    pub fn record_cancel_outcome(&self, outcome: &'static str) {
        counter!("cancel_outcomes_total", "market" => self.market.clone(), "outcome" => outcome)
            .increment(1);
    }

    pub fn record_compensation(&self) {
        self.compensations.increment(1);
    }
}

/// Times one engine command; records into [`MarketMetrics`] on drop
///
/// ```ignore
/// let mut timer = CommandTimer::new(&metrics);
/// let events = engine.process(cmd, ts)?;
/// timer.set_output(events.len(), trades);
/// ```
pub struct CommandTimer<'a> {
    metrics: &'a MarketMetrics,
    start: Instant,
    events: usize,
    trades: usize,
}

impl<'a> CommandTimer<'a> {
    pub fn new(metrics: &'a MarketMetrics) -> Self {
        Self {
            metrics,
            start: Instant::now(),
            events: 0,
            trades: 0,
        }
    }

    pub fn set_output(&mut self, events: usize, trades: usize) {
        self.events = events;
        self.trades = trades;
    }
}

impl Drop for CommandTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_command(self.start.elapsed(), self.events, self.trades);
    }
}
