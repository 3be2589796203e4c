use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MasterConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());

    let substituted = substitution::substitute_env_vars(&content)?;
    debug!("Environment variable substitution completed");

    let config: MasterConfig = serde_yaml::from_str(&substituted)
        .with_context(|| "Failed to parse YAML configuration")?;

    info!(markets = config.markets.len(), "Configuration loaded successfully");
    Ok(config)
}

#[instrument]
pub fn generate_default_config() -> MasterConfig {
    MasterConfig {
        exchange: ExchangeConfig {
            name: "My Exchange".to_string(),
            description: "A spot cryptocurrency exchange".to_string(),
            version: "1.0.0".to_string(),
            fee_account: default_fee_account(),
        },
        logging: LoggingConfig::default(),
        metrics: MetricsConfig::default(),
        server: ServerSection::default(),
        storage: StorageConfig::default(),
        log: LogConfig::default(),
        engine: EngineConfig::default(),
        cancel: CancelConfig::default(),
        orchestrator: OrchestratorConfig::default(),
        recovery: RecoveryConfig::default(),
        intake: IntakeConfig::default(),
        fees: FeesConfig::default(),
        coins: vec![
            CoinConfig {
                symbol: "BTC".to_string(),
                name: "Bitcoin".to_string(),
                precision: 8,
            },
            CoinConfig {
                symbol: "USDT".to_string(),
                name: "Tether".to_string(),
                precision: 6,
            },
        ],
        markets: vec![MarketConfig {
            id: "btcusdt".to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            base_precision: 6,
            quote_precision: 2,
            min_base_volume: "0.0001".to_string(),
            min_quote_volume: "1.00".to_string(),
            max_base_price: "1000".to_string(),
            max_quote_price: "1000000.00".to_string(),
            max_quote_spend: "1000000.00".to_string(),
            status: common::MarketStatus::Active,
        }],
    }
}

#[instrument]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &MasterConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}
