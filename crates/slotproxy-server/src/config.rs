//! `serve` configuration: command-line flags with environment fallbacks,
//! validated into a [`ProxyConfig`].

use std::collections::HashSet;
use std::time::Duration;

use clap::Args;
use reqwest::Url;

use slotproxy::admission::DEFAULT_QUEUE_CAPACITY;
use slotproxy::transport::http::{DEFAULT_MAX_INBOUND_MESSAGE_SIZE, DEFAULT_PORT, ServerConfig};
use slotproxy::{ChannelId, OrchestratorConfig, VersionInfo};

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "SLOTPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "SLOTPROXY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Largest accepted request body, in bytes
    #[arg(
        long,
        env = "SLOTPROXY_MAX_INBOUND_MESSAGE_SIZE",
        default_value_t = DEFAULT_MAX_INBOUND_MESSAGE_SIZE
    )]
    pub max_inbound_message_size: usize,

    /// Seconds between metric reports
    #[arg(long, env = "SLOTPROXY_REPORT_PERIOD_SECS", default_value_t = 60)]
    pub report_period_secs: u64,

    /// Requests that may wait for a free worker
    #[arg(long, env = "SLOTPROXY_QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_size: usize,

    /// Seconds in-flight calls may run once shutdown starts
    #[arg(long, env = "SLOTPROXY_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Organization owning the backend service
    #[arg(long, env = "SLOTPROXY_ORGANIZATION_ID")]
    pub organization_id: String,

    /// Backend service id
    #[arg(long, env = "SLOTPROXY_SERVICE_ID")]
    pub service_id: String,

    /// Payment group the channels were opened in
    #[arg(long, env = "SLOTPROXY_PAYMENT_GROUP_ID", default_value = "default_group")]
    pub payment_group_id: String,

    /// Pre-funded payment channel ids (decimal or 0x-prefixed hex), one slot each
    #[arg(
        long = "channel",
        env = "SLOTPROXY_CHANNELS",
        value_delimiter = ',',
        required = true
    )]
    pub channels: Vec<ChannelId>,

    /// Backend endpoint receiving forwarded payloads
    #[arg(long, env = "SLOTPROXY_BACKEND_URL")]
    pub backend_url: String,

    /// Per-call backend timeout in seconds; unset waits indefinitely
    #[arg(long, env = "SLOTPROXY_BACKEND_TIMEOUT_SECS")]
    pub backend_timeout_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one payment channel is required")]
    NoChannels,
    #[error("payment channel {0} is listed more than once")]
    DuplicateChannel(ChannelId),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid backend url {url:?}: {reason}")]
    BackendUrl { url: String, reason: String },
}

/// Identity and endpoint used for every backend call.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: Url,
    pub organization_id: String,
    pub service_id: String,
    pub payment_group_id: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub backend: BackendConfig,
    pub channels: Vec<ChannelId>,
    pub report_period: Duration,
}

fn non_empty(value: String, name: &'static str) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Empty(name))
    } else {
        Ok(value)
    }
}

fn non_zero(value: u64, name: &'static str) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero(name))
    } else {
        Ok(value)
    }
}

fn parse_backend_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::BackendUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

impl TryFrom<ServeArgs> for ProxyConfig {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        if args.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let mut seen = HashSet::new();
        for channel in &args.channels {
            if !seen.insert(*channel) {
                return Err(ConfigError::DuplicateChannel(*channel));
            }
        }

        if args.max_inbound_message_size == 0 {
            return Err(ConfigError::Zero("max inbound message size"));
        }
        let report_period = Duration::from_secs(non_zero(args.report_period_secs, "report period")?);
        let timeout = args
            .backend_timeout_secs
            .map(|secs| non_zero(secs, "backend timeout").map(Duration::from_secs))
            .transpose()?;

        let organization_id = non_empty(args.organization_id, "organization id")?;
        let service_id = non_empty(args.service_id, "service id")?;
        let payment_group_id = non_empty(args.payment_group_id, "payment group id")?;
        let url = parse_backend_url(&args.backend_url)?;

        let version = VersionInfo::new().with_service(format!("{organization_id}/{service_id}"));

        Ok(Self {
            server: ServerConfig {
                host: args.host,
                port: args.port,
                max_inbound_message_size: args.max_inbound_message_size,
            },
            orchestrator: OrchestratorConfig::default()
                .with_queue_capacity(args.queue_size)
                .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs))
                .with_version(version),
            backend: BackendConfig {
                url,
                organization_id,
                service_id,
                payment_group_id,
                timeout,
            },
            channels: args.channels,
            report_period,
        })
    }
}
