//! Listener configuration for the SpotX API server

use std::net::SocketAddr;
use std::time::Duration;

use ::config::ServerSection;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Requests still running after this are answered with 408
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn http_only(host: impl Into<String>, http_port: u16) -> Self {
        Self {
            host: host.into(),
            http_port,
            request_timeout: Duration::from_millis(::config::default_request_timeout_ms()),
        }
    }

    /// Override the port, e.g. from `--port`
    pub fn with_port(mut self, http_port: u16) -> Self {
        self.http_port = http_port;
        self
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.http_port);
        addr.parse()
            .map_err(|_| ServerError::InvalidAddress(addr))
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            http_port: section.http_port,
            request_timeout: Duration::from_millis(section.request_timeout_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_section() {
        let section = ServerSection {
            host: "127.0.0.1".to_string(),
            http_port: 9000,
            request_timeout_ms: 1_500,
        };
        let config = ServerConfig::from(&section);
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.request_timeout, Duration::from_millis(1_500));
    }

    #[test]
    fn test_port_override() {
        let config = ServerConfig::default().with_port(8181);
        assert_eq!(config.http_port, 8181);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        let config = ServerConfig::http_only("not a host", 8080);
        assert!(matches!(
            config.bind_addr(),
            Err(ServerError::InvalidAddress(_))
        ));
    }
}
