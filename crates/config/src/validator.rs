use crate::*;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("Exchange name is required")]
    MissingExchangeName,

    #[error("Invalid version format: {0}. Must be in format X.Y.Z (e.g., 1.0.0)")]
    InvalidVersionFormat(String),

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("No markets defined")]
    NoMarkets,

    #[error("Market {market}: {message}")]
    InvalidMarket { market: String, message: String },

    #[error("Duplicate market id '{0}'")]
    DuplicateMarket(String),

    #[error("Coin {symbol}: {message}")]
    InvalidCoin { symbol: String, message: String },

    #[error("Storage: {message}")]
    InvalidStorage { message: String },

    #[error("Log: {message}")]
    InvalidLog { message: String },

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("{field} must be between 0 and 10000 basis points")]
    InvalidBps { field: String },

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &MasterConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_exchange(&config.exchange, &mut report);
    validate_logging(&config.logging, &mut report);
    validate_storage(&config.storage, &mut report);
    validate_log(&config.log, &mut report);
    validate_engine(config, &mut report);
    validate_fees(&config.fees, &mut report);
    validate_coins(&config.coins, &mut report);
    validate_markets(config, &mut report);

    report
}

fn validate_exchange(exchange: &ExchangeConfig, report: &mut ValidationReport) {
    if exchange.name.is_empty() {
        report.add_error(ValidationError::MissingExchangeName);
    }

    let version_ok = Regex::new(r"^\d+\.\d+\.\d+$")
        .map(|re| re.is_match(&exchange.version))
        .unwrap_or(false);
    if !version_ok {
        report.add_error(ValidationError::InvalidVersionFormat(exchange.version.clone()));
    }
}

fn validate_logging(logging: &LoggingConfig, report: &mut ValidationReport) {
    let valid_formats = ["pretty", "json", "compact"];
    if !valid_formats.contains(&logging.format.to_lowercase().as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(logging.format.clone()));
    }
}

fn validate_storage(storage: &StorageConfig, report: &mut ValidationReport) {
    match storage.storage_type.as_str() {
        "memory" => report.add_warning(
            "storage.type",
            "in-memory storage does not survive restarts",
        ),
        "postgres" => match storage.postgres {
            Some(ref pg) => validate_postgres_config(pg, report),
            None => report.add_error(ValidationError::InvalidStorage {
                message: "Storage type is 'postgres' but postgres configuration is missing"
                    .to_string(),
            }),
        },
        other => report.add_error(ValidationError::InvalidStorage {
            message: format!(
                "Invalid storage type '{}'. Must be one of: memory, postgres",
                other
            ),
        }),
    }
}

fn validate_postgres_config(pg: &PostgresConfig, report: &mut ValidationReport) {
    if pg.port == 0 {
        report.add_error(ValidationError::InvalidStorage {
            message: "port must be a positive integer".to_string(),
        });
    }

    if pg.max_connections == 0 {
        report.add_error(ValidationError::InvalidStorage {
            message: "max_connections must be a positive integer".to_string(),
        });
    }

    if pg.connection_timeout_seconds == 0 {
        report.add_error(ValidationError::InvalidStorage {
            message: "connection_timeout_seconds must be a positive integer".to_string(),
        });
    }

    if pg.password.is_empty() || has_unresolved_env_vars(&pg.password) {
        report.add_error(ValidationError::InvalidEnvVar {
            var: "storage.postgres.password".to_string(),
            message: "postgres password is missing or unresolved".to_string(),
        });
    }

    if url::Url::parse(&pg.connection_url()).is_err() {
        report.add_error(ValidationError::InvalidStorage {
            message: "postgres connection parameters do not form a valid URL".to_string(),
        });
    }
}

fn validate_log(log: &LogConfig, report: &mut ValidationReport) {
    match log.log_type.as_str() {
        "memory" => report.add_warning("log.type", "in-memory event log does not survive restarts"),
        "redis" => match log.redis {
            Some(ref redis) => {
                if has_unresolved_env_vars(&redis.host) || has_unresolved_env_vars(&redis.password) {
                    report.add_error(ValidationError::InvalidEnvVar {
                        var: "log.redis".to_string(),
                        message: "redis host or password is unresolved".to_string(),
                    });
                }
                if url::Url::parse(&redis.connection_url()).is_err() {
                    report.add_error(ValidationError::InvalidLog {
                        message: "redis connection parameters do not form a valid URL".to_string(),
                    });
                }
            }
            None => report.add_error(ValidationError::InvalidLog {
                message: "Log type is 'redis' but redis configuration is missing".to_string(),
            }),
        },
        other => report.add_error(ValidationError::InvalidLog {
            message: format!("Invalid log type '{}'. Must be one of: memory, redis", other),
        }),
    }

    if log.wallet_poll_ms == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "log.wallet_poll_ms".to_string(),
        });
    }
}

fn validate_engine(config: &MasterConfig, report: &mut ValidationReport) {
    let positive = [
        ("engine.command_buffer", config.engine.command_buffer as u64),
        ("engine.event_buffer", config.engine.event_buffer as u64),
        ("engine.terminated_cache_size", config.engine.terminated_cache_size as u64),
        ("engine.depth_levels", config.engine.depth_levels as u64),
        ("cancel.timeout_ms", config.cancel.timeout_ms),
        ("orchestrator.cancel_attempts", config.orchestrator.cancel_attempts as u64),
        ("orchestrator.cancel_budget_ms", config.orchestrator.cancel_budget_ms),
        ("recovery.history_window", config.recovery.history_window as u64),
    ];

    for (field, value) in positive {
        if value == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: field.to_string(),
            });
        }
    }

    if config.intake.market_buy_buffer_bps > common::decimal::BPS_DENOMINATOR {
        report.add_error(ValidationError::InvalidBps {
            field: "intake.market_buy_buffer_bps".to_string(),
        });
    }
}

fn validate_fees(fees: &FeesConfig, report: &mut ValidationReport) {
    let max = common::decimal::BPS_DENOMINATOR;
    if fees.maker_bps > max {
        report.add_error(ValidationError::InvalidBps {
            field: "fees.maker_bps".to_string(),
        });
    }
    if fees.taker_bps > max {
        report.add_error(ValidationError::InvalidBps {
            field: "fees.taker_bps".to_string(),
        });
    }
    for tier in &fees.tiers {
        if tier.maker_bps > max || tier.taker_bps > max {
            report.add_error(ValidationError::InvalidBps {
                field: format!("fees.tiers[user_id={}]", tier.user_id),
            });
        }
    }
}

fn validate_coins(coins: &[CoinConfig], report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for coin in coins {
        if coin.symbol.is_empty() {
            report.add_error(ValidationError::InvalidCoin {
                symbol: "unknown".to_string(),
                message: "Symbol is required".to_string(),
            });
            continue;
        }
        if !seen.insert(coin.symbol.as_str()) {
            report.add_error(ValidationError::InvalidCoin {
                symbol: coin.symbol.clone(),
                message: "defined more than once".to_string(),
            });
        }
        if coin.precision > common::decimal::MAX_PRECISION {
            report.add_error(ValidationError::InvalidCoin {
                symbol: coin.symbol.clone(),
                message: format!(
                    "precision {} exceeds {}",
                    coin.precision,
                    common::decimal::MAX_PRECISION
                ),
            });
        }
    }
}

fn validate_markets(config: &MasterConfig, report: &mut ValidationReport) {
    if config.markets.is_empty() {
        report.add_error(ValidationError::NoMarkets);
        return;
    }

    let id_ok = |id: &str| {
        Regex::new(r"^[a-z0-9]+$")
            .map(|re| re.is_match(id))
            .unwrap_or(false)
    };
    let coins: HashSet<&str> = config.coins.iter().map(|c| c.symbol.as_str()).collect();
    let mut seen = HashSet::new();

    for (i, market) in config.markets.iter().enumerate() {
        if !seen.insert(market.id.as_str()) {
            report.add_error(ValidationError::DuplicateMarket(market.id.clone()));
        }

        if !id_ok(&market.id) {
            report.add_error(ValidationError::InvalidMarket {
                market: market.id.clone(),
                message: "id must be lowercase alphanumeric".to_string(),
            });
        }

        if market.base == market.quote {
            report.add_error(ValidationError::InvalidMarket {
                market: market.id.clone(),
                message: "base and quote must differ".to_string(),
            });
        }

        if !coins.is_empty() {
            for symbol in [&market.base, &market.quote] {
                if !coins.contains(symbol.as_str()) {
                    report.add_error(ValidationError::InvalidMarket {
                        market: market.id.clone(),
                        message: format!("coin '{}' is not listed under coins", symbol),
                    });
                }
            }
        }

        if let Err(e) = market.to_market() {
            report.add_error(ValidationError::InvalidMarket {
                market: market.id.clone(),
                message: e.to_string(),
            });
            continue;
        }

        for (field, value) in [
            ("max_base_price", &market.max_base_price),
            ("max_quote_price", &market.max_quote_price),
            ("max_quote_spend", &market.max_quote_spend),
        ] {
            if value.trim() == "0" {
                report.add_default(&format!("markets[{}].{}", i, field), "unlimited");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> MasterConfig {
        generate_default_config()
    }

    #[test]
    fn test_memory_backends_warn() {
        let report = validate_config(&base_config());
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.field == "storage.type"));
        assert!(report.warnings.iter().any(|w| w.field == "log.type"));
    }

    #[test]
    fn test_invalid_exchange_and_logging() {
        let mut config = base_config();
        config.exchange.name.clear();
        config.exchange.version = "v1".to_string();
        config.logging.format = "xml".to_string();

        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::MissingExchangeName)));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidVersionFormat(_))));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidLogFormat(_))));
    }

    #[test]
    fn test_postgres_requires_section_and_password() {
        let mut config = base_config();
        config.storage.storage_type = "postgres".to_string();
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidStorage { .. })));

        config.storage.postgres = Some(PostgresConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "spotx".to_string(),
            user: "spotx".to_string(),
            password: "${SPOTX_DB_PASSWORD}".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: 20,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        });
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_market_rules() {
        let mut config = base_config();
        let mut dup = config.markets[0].clone();
        dup.quote = "BTC".to_string();
        config.markets.push(dup);
        config.markets[0].min_base_volume = "0.0000001".to_string();

        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateMarket(_))));
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidMarket { message, .. } if message.contains("differ")
        )));
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidMarket { message, .. } if message.contains("decimal places")
        )));
    }

    #[test]
    fn test_unknown_coin_and_bad_bps() {
        let mut config = base_config();
        config.markets[0].quote = "EUR".to_string();
        config.fees.taker_bps = 20_000;
        config.engine.command_buffer = 0;

        let report = validate_config(&config);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidMarket { message, .. } if message.contains("EUR")
        )));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidBps { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidPositiveInteger { .. })));
    }

    #[test]
    fn test_no_markets() {
        let mut config = base_config();
        config.markets.clear();
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::NoMarkets)));
    }
}
