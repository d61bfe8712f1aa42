//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use super::routes::routes;
use crate::orchestrator::ProxyOrchestrator;

pub const DEFAULT_PORT: u16 = 1234;

pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in bytes.
    pub max_inbound_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
        }
    }
}

/// Serve until a shutdown signal, then shut the proxy down.
pub async fn serve(config: ServerConfig, proxy: Arc<ProxyOrchestrator>) -> anyhow::Result<()> {
    let shutdown_rx = proxy.shutdown_rx();
    let app = routes(Arc::clone(&proxy), config.max_inbound_message_size);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(
        max_inbound_message_size = config.max_inbound_message_size,
        "Starting slotproxy server on {}", actual_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    // Channels stay open until the server has stopped accepting requests.
    proxy.shutdown().await;

    Ok(())
}

/// Wait for SIGINT, SIGTERM or the `/shutdown` endpoint.
///
/// A signal handler that cannot be installed is logged and never fires; the
/// remaining triggers still work.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
