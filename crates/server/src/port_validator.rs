//! Early port checks for `spotx start` and `spotx validate`
//!
//! A free port here can still be taken before the real bind; the bind in
//! [`HttpServer::run`](crate::HttpServer) is authoritative.

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Reject port 0 and warn about privileged ports
pub fn validate_port_range(port: u16) -> Result<()> {
    if port == 0 {
        return Err(ServerError::ConfigError(
            "http_port must be set explicitly".to_string(),
        ));
    }
    if port < 1024 {
        warn!(port, "Privileged port; binding needs elevated rights");
    }
    Ok(())
}

/// Check that the configured HTTP port can be bound right now
pub async fn validate_port_available(config: &ServerConfig) -> Result<()> {
    validate_port_range(config.http_port)?;
    let addr = config.bind_addr()?;
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            info!(%addr, "HTTP port available");
            Ok(())
        }
        Err(e) => Err(ServerError::port_in_use(config.http_port, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port_range() {
        assert!(validate_port_range(0).is_err());
        assert!(validate_port_range(443).is_ok());
        assert!(validate_port_range(8080).is_ok());
    }

    #[tokio::test]
    async fn test_taken_port_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ServerConfig::http_only("127.0.0.1", port);
        assert!(matches!(
            validate_port_available(&config).await,
            Err(ServerError::PortInUse { .. })
        ));

        drop(listener);
        assert!(validate_port_available(&config).await.is_ok());
    }
}
