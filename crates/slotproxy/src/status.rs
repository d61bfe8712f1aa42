//! Caller-visible error taxonomy.

use crate::downstream::{Code, DownstreamError};

/// The single terminal error a caller can receive.
///
/// Admission and resource failures are normalised to `resource_exhausted` with a
/// distinguishing message. Only downstream errors are surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("request queue is full")]
    QueueFull,

    #[error("no payment channel available")]
    NoSlotAvailable,

    #[error("proxy is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

impl ProxyError {
    pub fn code(&self) -> Code {
        match self {
            Self::QueueFull | Self::NoSlotAvailable => Code::ResourceExhausted,
            Self::ShuttingDown => Code::Unavailable,
            Self::Downstream(e) => e.code(),
        }
    }

    /// Human-readable reason. Downstream messages pass through untouched.
    pub fn message(&self) -> String {
        match self {
            Self::Downstream(e) => e.message().to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::QueueFull | Self::NoSlotAvailable)
    }
}
