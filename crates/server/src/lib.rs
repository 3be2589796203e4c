//! Process host for SpotX
//!
//! Wraps a running [`trading::Exchange`] in the HTTP API and owns the
//! shutdown order: stop accepting requests, drain, then stop the markets.
//!
//! ```ignore
//! let exchange = Exchange::start(&config).await?;
//! let server = SpotxServer::new(ServerConfig::from(&config.server), exchange);
//! server.run(ShutdownController::with_signals().token()).await?;
//! ```

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use trading::api::{create_api_state, create_router};
use trading::Exchange;

pub mod config;
pub mod error;
pub mod http;
pub mod port_validator;
pub mod shutdown;
pub mod traits;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use http::HttpServer;
pub use port_validator::{validate_port_available, validate_port_range};
pub use shutdown::ShutdownController;
pub use traits::{Server, ServerExt};

/// The trading API in front of one exchange
#[derive(Clone)]
pub struct SpotxServer {
    exchange: Arc<Exchange>,
    http: HttpServer,
}

impl SpotxServer {
    pub fn new(config: ServerConfig, exchange: Arc<Exchange>) -> Self {
        let router = create_router(create_api_state(exchange.clone()));
        Self {
            exchange,
            http: HttpServer::new(config, router),
        }
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }
}

#[async_trait]
impl Server for SpotxServer {
    fn name(&self) -> &str {
        "spotx"
    }

    fn address(&self) -> Option<SocketAddr> {
        self.http.address()
    }

    fn is_running(&self) -> bool {
        self.http.is_running()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let served = self.http.run(shutdown).await;
        info!("Stopping markets");
        self.exchange.shutdown().await;
        served
    }
}
