use serde::{Deserialize, Serialize};

use common::{decimal, AccountKey, Market, MarketStatus};

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use substitution::*;
pub use validator::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cancel: CancelConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub coins: Vec<CoinConfig>,
    pub markets: Vec<MarketConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    /// Account credited with trading fees
    #[serde(default = "default_fee_account")]
    pub fee_account: AccountRef,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct AccountRef {
    pub user_id: u64,
    #[serde(default)]
    pub sub_account: u64,
}

impl From<AccountRef> for AccountKey {
    fn from(r: AccountRef) -> Self {
        AccountKey::new(r.user_id, r.sub_account)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Relational store for orders, trades, liabilities and queue positions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            postgres: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl PostgresConfig {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

/// Durable event log backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(rename = "type")]
    #[serde(default = "default_log_type")]
    pub log_type: String,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_wallet_poll_ms")]
    pub wallet_poll_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_type: default_log_type(),
            redis: None,
            wallet_poll_ms: default_wallet_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db_index: u8,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db_index)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db_index
            )
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_terminated_cache_size")]
    pub terminated_cache_size: usize,
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,
    #[serde(default = "default_projection_retries")]
    pub projection_retries: u32,
    #[serde(default = "default_projection_backoff_ms")]
    pub projection_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_buffer: default_command_buffer(),
            event_buffer: default_event_buffer(),
            terminated_cache_size: default_terminated_cache_size(),
            depth_levels: default_depth_levels(),
            projection_retries: default_projection_retries(),
            projection_backoff_ms: default_projection_backoff_ms(),
        }
    }
}

/// Synchronous cancel API behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CancelConfig {
    #[serde(default = "default_cancel_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_cancel_timeout_ms(),
            retries: 0,
        }
    }
}

/// Sibling/cascade cancellation issued by the advanced-order orchestrator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_cancel_attempts")]
    pub cancel_attempts: u32,
    #[serde(default = "default_cancel_budget_ms")]
    pub cancel_budget_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cancel_attempts: default_cancel_attempts(),
            cancel_budget_ms: default_cancel_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// How many trailing log records recovery inspects per topic
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntakeConfig {
    /// Headroom added to estimated market-buy funds, in 1/10 000
    #[serde(default = "default_market_buy_buffer_bps")]
    pub market_buy_buffer_bps: u64,
    /// Users exempt from max_quote_spend
    #[serde(default)]
    pub market_maker_accounts: Vec<u64>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            market_buy_buffer_bps: default_market_buy_buffer_bps(),
            market_maker_accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeesConfig {
    #[serde(default = "default_maker_bps")]
    pub maker_bps: u64,
    #[serde(default = "default_taker_bps")]
    pub taker_bps: u64,
    #[serde(default)]
    pub tiers: Vec<FeeTierConfig>,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            maker_bps: default_maker_bps(),
            taker_bps: default_taker_bps(),
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeeTierConfig {
    pub user_id: u64,
    pub maker_bps: u64,
    pub taker_bps: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoinConfig {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub precision: u32,
}

/// Market definition with human-readable decimal limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketConfig {
    pub id: String,
    pub base: String,
    pub quote: String,
    pub base_precision: u32,
    pub quote_precision: u32,
    #[serde(default = "default_zero")]
    pub min_base_volume: String,
    #[serde(default = "default_zero")]
    pub min_quote_volume: String,
    #[serde(default = "default_zero")]
    pub max_base_price: String,
    #[serde(default = "default_zero")]
    pub max_quote_price: String,
    #[serde(default = "default_zero")]
    pub max_quote_spend: String,
    #[serde(default)]
    pub status: MarketStatus,
}

impl MarketConfig {
    /// Convert the decimal limits into a scaled [`Market`].
    pub fn to_market(&self) -> common::Result<Market> {
        Ok(Market {
            id: self.id.clone(),
            base: self.base.clone(),
            quote: self.quote.clone(),
            base_precision: self.base_precision,
            quote_precision: self.quote_precision,
            min_base_volume: decimal::to_scaled(&self.min_base_volume, self.base_precision)?,
            min_quote_volume: decimal::to_scaled(&self.min_quote_volume, self.quote_precision)?,
            max_base_price: decimal::to_scaled(&self.max_base_price, self.base_precision)?,
            max_quote_price: decimal::to_scaled(&self.max_quote_price, self.quote_precision)?,
            max_quote_spend: decimal::to_scaled(&self.max_quote_spend, self.quote_precision)?,
            status: self.status,
        })
    }
}

impl MasterConfig {
    /// All configured markets in scaled form.
    pub fn markets(&self) -> common::Result<Vec<Market>> {
        self.markets.iter().map(MarketConfig::to_market).collect()
    }
}
