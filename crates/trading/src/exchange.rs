//! Process wiring
//!
//! [`Exchange`] builds every component from a [`MasterConfig`], recovers
//! each active market and starts its engine, dispatcher and the wallet
//! bridge. One instance per process.

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::{AccountKey, Market};
use config::MasterConfig;
use fms::{FundsManager, InMemoryLiabilityStore, LiabilityStore};
use matching_engine::{EngineRunner, RunnerLinks};
use oms::{FeeSchedule, InMemoryOrderStore, OrderManager, OrderStore, Projector, Sequencer};
use storage::{InMemoryLog, InMemoryPositionStore, PositionStore, SharedLog, StorageError};

use crate::cancel::{CancelPolicy, CancelRouter, CancelService};
use crate::dispatcher::{Dispatcher, Pipeline, RetryPolicy};
use crate::intake::OrderIntake;
use crate::orchestrator::Orchestrator;
use crate::price_feed::LastPriceCache;
use crate::recovery::{RecoveredMarket, Recovery};
use crate::registry::{MarketHandle, MarketRegistry};
use crate::wallet::WalletBridge;
use crate::Result;

/// Storage the exchange runs on
#[derive(Clone)]
pub struct Backends {
    pub log: SharedLog,
    pub orders: Arc<dyn OrderStore>,
    pub liabilities: Arc<dyn LiabilityStore>,
    pub positions: Arc<dyn PositionStore>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            log: Arc::new(InMemoryLog::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
            liabilities: Arc::new(InMemoryLiabilityStore::new()),
            positions: Arc::new(InMemoryPositionStore::new()),
        }
    }

    /// Backends selected by the `storage` and `log` sections
    pub async fn from_config(config: &MasterConfig) -> Result<Self> {
        let log = storage::create_log(&config.log).await?;

        match config.storage.storage_type.as_str() {
            "memory" | "inmemory" | "in_memory" => {
                info!("Using in-memory stores");
                Ok(Self {
                    log,
                    ..Self::in_memory()
                })
            }
            "postgres" => Self::postgres(config, log).await,
            other => Err(StorageError::Config(format!("unknown storage type '{}'", other)).into()),
        }
    }

    #[cfg(feature = "postgres")]
    async fn postgres(config: &MasterConfig, log: SharedLog) -> Result<Self> {
        let pg = config.storage.postgres.as_ref().ok_or_else(|| {
            StorageError::Config("postgres configuration required for postgres storage".to_string())
        })?;
        let pool = storage::postgres::connect(pg).await?;
        storage::postgres::run_migrations(&pool).await?;
        storage::postgres::sync_catalog(&pool, &config.coins, &config.markets()?).await?;

        Ok(Self {
            log,
            orders: Arc::new(oms::PostgresOrderStore::new(pool.clone())),
            liabilities: Arc::new(fms::PostgresLiabilityStore::new(pool.clone())),
            positions: Arc::new(storage::postgres::PostgresPositionStore::new(pool)),
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn postgres(_config: &MasterConfig, _log: SharedLog) -> Result<Self> {
        Err(StorageError::Config("built without the 'postgres' feature".to_string()).into())
    }
}

pub struct Exchange {
    markets: Vec<Market>,
    log: SharedLog,
    funds: Arc<FundsManager>,
    sequencer: Arc<Sequencer>,
    projector: Arc<Projector>,
    registry: Arc<MarketRegistry>,
    prices: Arc<LastPriceCache>,
    intake: Arc<OrderIntake>,
    cancels: Arc<CancelService>,
    orchestrator: Arc<Orchestrator>,
    wallet: Arc<WalletBridge>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Exchange {
    /// Build the exchange on the configured backends and start it
    pub async fn start(config: &MasterConfig) -> Result<Arc<Self>> {
        let backends = Backends::from_config(config).await?;
        Self::with_backends(config, backends).await
    }

    /// Build the exchange on explicit backends and start it
    pub async fn with_backends(config: &MasterConfig, backends: Backends) -> Result<Arc<Self>> {
        let markets = config.markets()?;
        let fee_account: AccountKey = config.exchange.fee_account.into();

        let funds = Arc::new(FundsManager::new(backends.liabilities.clone(), fee_account));
        let rows = funds.bootstrap().await?;
        info!(rows, fee_account = %fee_account, "Funds ledger loaded");

        let sequencer = Arc::new(Sequencer::new());
        let projector = Arc::new(Projector::new(
            Arc::new(OrderManager::new()),
            backends.orders.clone(),
            funds.clone(),
            sequencer.clone(),
            FeeSchedule::from_config(&config.fees),
            markets.clone(),
            backends.log.clone(),
        ));

        let registry = Arc::new(MarketRegistry::new());
        let prices = Arc::new(LastPriceCache::new());
        let intake = Arc::new(OrderIntake::new(
            projector.clone(),
            funds.clone(),
            sequencer.clone(),
            registry.clone(),
            prices.clone(),
            config.intake.clone(),
        ));
        let router = Arc::new(CancelRouter::new());
        let cancels = Arc::new(CancelService::new(
            router.clone(),
            registry.clone(),
            projector.clone(),
            CancelPolicy::api(&config.cancel),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            projector.clone(),
            intake.clone(),
            cancels.clone(),
            CancelPolicy::orchestrator(&config.orchestrator),
        ));
        let wallet = Arc::new(WalletBridge::new(
            funds.clone(),
            backends.log.clone(),
            backends.positions.clone(),
            Duration::from_millis(config.log.wallet_poll_ms),
        ));

        let exchange = Arc::new(Self {
            markets: markets.clone(),
            log: backends.log.clone(),
            funds,
            sequencer: sequencer.clone(),
            projector: projector.clone(),
            registry,
            prices: prices.clone(),
            intake,
            cancels,
            orchestrator: orchestrator.clone(),
            wallet,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let recovery = Recovery::new(
            projector.clone(),
            backends.log.clone(),
            prices.clone(),
            config.recovery.clone(),
        );
        let active: Vec<Market> = markets.into_iter().filter(Market::is_active).collect();
        recovery.seed_sequencer(&sequencer, &active).await?;

        let pipeline = Pipeline {
            projector,
            router,
            prices,
            orchestrator,
            log: backends.log.clone(),
            retry: RetryPolicy::from_config(&config.engine),
        };

        for market in &active {
            match recovery.recover_market(market, &config.engine).await {
                Ok(recovered) => {
                    exchange
                        .launch(market, recovered, &backends, &pipeline, config)
                        .await
                }
                Err(e) => {
                    error!(market = %market.id, error = %e, "Recovery failed, market not started")
                }
            }
        }

        let wallet = exchange.wallet.clone();
        let token = exchange.shutdown.child_token();
        exchange.track(tokio::spawn(wallet.run(token)));

        info!(
            markets = exchange.registry.ids().len(),
            last_order_id = exchange.sequencer.last_order_id(),
            "Exchange started"
        );
        Ok(exchange)
    }

    /// Start a recovered market's engine and dispatcher
    async fn launch(
        &self,
        market: &Market,
        recovered: RecoveredMarket,
        backends: &Backends,
        pipeline: &Pipeline,
        config: &MasterConfig,
    ) {
        let engine_config = &config.engine;
        let (command_tx, command_rx) = mpsc::channel(engine_config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(engine_config.event_buffer);
        let (depth_tx, depth_rx) =
            watch::channel(recovered.engine.snapshot(engine_config.depth_levels));
        let halted = Arc::new(AtomicBool::new(false));

        let handle = self.registry.insert(MarketHandle::new(
            market.clone(),
            command_tx,
            depth_rx,
            halted.clone(),
            backends.log.clone(),
        ));

        let runner = EngineRunner::new(
            recovered.engine,
            RunnerLinks {
                commands: command_rx,
                events: event_tx,
                depth: depth_tx,
                halted,
                shutdown: self.shutdown.child_token(),
            },
            engine_config.depth_levels,
        );
        let market_id = market.id.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(market = %market_id, error = %e, "Market engine stopped");
            }
        }));

        let dispatcher = Dispatcher::new(handle.clone(), event_rx, pipeline.clone());
        self.track(tokio::spawn(dispatcher.run(self.shutdown.child_token())));

        if !recovered.resubmit.is_empty() {
            if let Err(e) = handle.submit_all(recovered.resubmit).await {
                warn!(market = %market.id, error = %e, "Pending orders not re-submitted");
            }
        }
        for projection in recovered.caught_up {
            self.orchestrator.observe(projection);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    pub fn funds(&self) -> &Arc<FundsManager> {
        &self.funds
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    pub fn registry(&self) -> &Arc<MarketRegistry> {
        &self.registry
    }

    pub fn prices(&self) -> &Arc<LastPriceCache> {
        &self.prices
    }

    pub fn intake(&self) -> &Arc<OrderIntake> {
        &self.intake
    }

    pub fn cancels(&self) -> &Arc<CancelService> {
        &self.cancels
    }

    pub fn wallet(&self) -> &Arc<WalletBridge> {
        &self.wallet
    }

    /// Stop every task and wait for them
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!("Exchange stopped");
    }
}
