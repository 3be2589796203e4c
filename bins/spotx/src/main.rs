//! SpotX CLI and server binary
//!
//! `spotx start` runs the exchange behind its HTTP API, `spotx validate`
//! checks a configuration file and `spotx init` writes a default one.

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::{
    generate_default_config, load_config, save_config, validate_config, MasterConfig,
    ValidationReport,
};
use observability::{init_logging, init_metrics, LogFormat};
use server::{validate_port_available, Server, ServerConfig, ShutdownController, SpotxServer};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use trading::Exchange;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start {
            config,
            port,
            log_format,
        } => start_command(config, port, log_format).await,
        Commands::Validate { config } => {
            init_logging("spotx", LogFormat::Pretty, "warn")?;
            validate_command(config).await
        }
        Commands::Init { output, force } => {
            init_logging("spotx", LogFormat::Pretty, "info")?;
            init_command(output, force)
        }
    }
}

async fn start_command(
    config_path: PathBuf,
    port: Option<u16>,
    log_format: Option<String>,
) -> Result<()> {
    let config = load_config(&config_path)?;

    let format = log_format.as_deref().unwrap_or(&config.logging.format);
    let format = LogFormat::parse(format).unwrap_or_default();
    init_logging("spotx", format, &config.logging.level)?;

    let report = validate_config(&config);
    log_report(&report);
    if !report.is_valid() {
        anyhow::bail!(
            "Cannot start exchange: {} configuration error(s)",
            report.errors.len()
        );
    }

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let mut server_config = ServerConfig::from(&config.server);
    if let Some(port) = port {
        server_config = server_config.with_port(port);
    }
    validate_port_available(&server_config).await?;

    info!(
        exchange = %config.exchange.name,
        markets = config.markets.len(),
        storage = %config.storage.storage_type,
        log = %config.log.log_type,
        "Starting exchange"
    );
    let exchange = Exchange::start(&config)
        .await
        .context("Failed to start exchange")?;

    let halted = exchange.registry().halted();
    if !halted.is_empty() {
        warn!(?halted, "Some markets did not recover and stay halted");
    }

    let shutdown = ShutdownController::with_signals();
    let server = SpotxServer::new(server_config, exchange);
    server.run(shutdown.token()).await?;

    info!("SpotX stopped");
    Ok(())
}

fn log_report(report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(field = %warning.field, "{}", warning.message);
    }
    for err in &report.errors {
        error!("{}", err);
    }
}

async fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    let server_config = ServerConfig::from(&config.server);
    if let Err(e) = validate_port_available(&server_config).await {
        println!("  [warn] [server.http_port] {}", e);
        println!();
    }

    println!("[ok] Configuration is valid!");
    println!();
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &MasterConfig) {
    println!("Exchange: {}", config.exchange.name);
    println!("Version: {}", config.exchange.version);
    println!(
        "Fee account: {}/{}",
        config.exchange.fee_account.user_id, config.exchange.fee_account.sub_account
    );
    println!("Storage: {}", config.storage.storage_type);
    println!("Event log: {}", config.log.log_type);
    println!("Coins: {}", config.coins.len());
    println!("Markets:");
    for market in &config.markets {
        println!(
            "  - {} ({}/{}, {:?})",
            market.id, market.base, market.quote, market.status
        );
    }
}

fn init_command(output_path: PathBuf, force: bool) -> Result<()> {
    if output_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output_path.display()
        );
    }
    ensure_parent(&output_path)?;

    let config = generate_default_config();
    save_config(&config, &output_path)?;

    println!("[ok] Configuration file created: {}", output_path.display());
    println!();
    print_summary(&config);
    println!();
    println!("Next steps:");
    println!("  1. Edit markets, coins and fees");
    println!("  2. Switch storage/log to postgres/redis for durable state");
    println!(
        "  3. spotx validate --config {}",
        output_path.display()
    );
    println!("  4. spotx start --config {}", output_path.display());
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display())),
        _ => Ok(()),
    }
}
