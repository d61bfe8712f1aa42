//! slotproxy: admission-controlled reverse proxy over a fixed pool of pre-paid
//! backend payment channels.

mod health;
mod request;
mod status;
mod version;

pub mod admission;
pub mod bridge;
pub mod downstream;
pub mod metrics;
pub mod orchestrator;
pub mod slot;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{Admission, OrchestratorConfig, ProxyOrchestrator};

pub use admission::{AdmitError, AdmitterConfig, RequestAdmitter};
pub use bridge::{
    CallBridge, CallObserver, ChannelSink, ResponseEvent, ResponseSink, SinkError, Terminal,
};
pub use downstream::{Code, ConnectError, Connector, Downstream, DownstreamError};
pub use health::{Health, HealthSnapshot};
pub use metrics::{
    MetricsError, MetricsSink, MetricsSnapshot, Outcome, ProxyMetrics, RejectReason, TracingSink,
};
pub use request::{InboundRequest, RequestId};
pub use slot::{ChannelId, SlotLease, SlotPool, SlotState};
pub use status::ProxyError;
pub use version::{SLOTPROXY_VERSION, VersionInfo};
