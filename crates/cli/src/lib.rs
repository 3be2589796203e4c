use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "master_config/master_config.yaml";

#[derive(Parser, Debug)]
#[command(name = "spotx")]
#[command(about = "SpotX - spot exchange trading core")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the exchange with the given configuration
    Start {
        /// Path to the configuration file
        #[arg(short, long, env = "SPOTX_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override `server.http_port`
        #[arg(long)]
        port: Option<u16>,

        /// Override `logging.format` (pretty, json, compact)
        #[arg(long)]
        log_format: Option<String>,
    },

    /// Validate configuration without starting the exchange
    Validate {
        /// Path to the configuration file
        #[arg(short, long, env = "SPOTX_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Write a configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "master_config.yaml")]
        output: PathBuf,

        /// Replace the file if it already exists
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_with_overrides() {
        let cli = Cli::try_parse_from([
            "spotx",
            "start",
            "--config",
            "prod.yaml",
            "--port",
            "9090",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Start {
                config: PathBuf::from("prod.yaml"),
                port: Some(9090),
                log_format: Some("json".to_string()),
            }
        );
    }

    #[test]
    fn test_init_defaults() {
        let cli = Cli::try_parse_from(["spotx", "init"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Init {
                output: PathBuf::from("master_config.yaml"),
                force: false,
            }
        );
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["spotx"]).is_err());
    }
}
