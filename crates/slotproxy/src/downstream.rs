//! Downstream collaborator contract.
//!
//! A [`Connector`] turns a payment channel id into a [`Downstream`] handle that can
//! start the streaming call against that one pre-paid allotment. Response events
//! flow back through the [`CallObserver`] handed to [`Downstream::start`]: any
//! number of chunks, then exactly one terminal event.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bridge::CallObserver;
use crate::slot::ChannelId;

/// Status code carried by a downstream terminal error.
///
/// Mirrors the canonical RPC status codes; the proxy never rewrites a code it
/// receives from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error reported by the backend for one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DownstreamError {
    code: Code,
    message: String,
}

impl DownstreamError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Caller or stream cancellation. Logged as expected rather than as a failure.
    pub fn is_cancellation(&self) -> bool {
        self.code == Code::Cancelled
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no payment channels configured")]
    NoChannels,
    #[error("payment channel {0} configured more than once")]
    Duplicate(ChannelId),
    #[error("failed to open payment channel {channel}: {reason}")]
    Channel { channel: ChannelId, reason: String },
}

/// Capability to run the streaming call against one payment channel.
///
/// Implementations deliver events asynchronously. `start` must not block; the
/// observer must eventually receive `on_completed` or `on_error`, and dropping it
/// without either is reported to the caller as an internal error.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    fn start(&self, payload: Bytes, observer: CallObserver);

    /// Release the underlying connection at process teardown.
    async fn close(&self) {}
}

/// Opens the downstream handle bound to a payment channel.
pub trait Connector: Send + Sync {
    fn connect(&self, channel: ChannelId) -> Result<Arc<dyn Downstream>, ConnectError>;
}
