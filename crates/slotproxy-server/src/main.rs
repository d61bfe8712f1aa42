//! slotproxy server entry point.
//!
//! `serve` wires the backend connector, slot pool, orchestrator, metric
//! reporter and HTTP transport together; `call` is a reference client.

mod backend;
mod client;
mod config;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use slotproxy::metrics::spawn_reporter;
use slotproxy::{MetricsSink, ProxyMetrics, ProxyOrchestrator, SlotPool, TracingSink};

use crate::backend::HttpConnector;
use crate::client::CallArgs;
use crate::config::{ProxyConfig, ServeArgs};

#[derive(Parser)]
#[command(name = "slotproxy")]
#[command(about = "Reverse proxy sharing a fixed pool of pre-paid payment channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy
    Serve(ServeArgs),
    /// Send one request through a running proxy
    Call(CallArgs),
}

/// Initialize tracing with SLOTPROXY_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SLOTPROXY_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "slotproxy={level},slotproxy_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = ProxyConfig::try_from(args)?;
    tracing::info!(
        port = config.server.port,
        max_inbound_message_size = config.server.max_inbound_message_size,
        queue_size = config.orchestrator.queue_capacity,
        report_period_secs = config.report_period.as_secs(),
        "Configuration loaded"
    );

    let connector = HttpConnector::new(config.backend);
    let pool = Arc::new(SlotPool::connect(&config.channels, &connector)?);
    let metrics = Arc::new(ProxyMetrics::new()?);

    let cancel = CancellationToken::new();
    let reporter = spawn_reporter(
        Arc::clone(&metrics),
        Arc::new(TracingSink) as Arc<dyn MetricsSink>,
        config.report_period,
        cancel.clone(),
    );

    let proxy = ProxyOrchestrator::start(pool, config.orchestrator, metrics);
    let result = slotproxy::transport::serve(config.server, proxy).await;

    cancel.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "Metrics reporter ended abnormally");
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Call(args) => {
            let summary = client::run(args).await?;
            println!("{} chunks, {} bytes", summary.chunks, summary.bytes);
            Ok(())
        }
    }
}
