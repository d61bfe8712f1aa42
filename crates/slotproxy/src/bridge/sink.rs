//! Response sinks: where a request's chunks and terminal event end up.

use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::request::RequestId;
use crate::status::ProxyError;

/// One event of a relayed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Chunk(Bytes),
    Completed,
    Error(ProxyError),
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("response receiver closed")]
    Closed,
    #[error("response sink failed: {0}")]
    Failed(String),
}

/// The inbound caller's response channel.
///
/// Methods are synchronous callbacks: they must hand the event off without
/// waiting on the caller.
pub trait ResponseSink: Send + 'static {
    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    fn on_completed(&mut self) -> Result<(), SinkError>;

    fn on_error(&mut self, error: ProxyError) -> Result<(), SinkError>;
}

/// Sink backed by an unbounded channel; the receiver is drained by the transport.
///
/// Chunks are never held back for a slow reader, so a large response to a
/// client that reads slowly is buffered in memory until the client catches up
/// or disconnects.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResponseEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResponseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ResponseEvent) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::Closed)
    }
}

impl ResponseSink for ChannelSink {
    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.send(ResponseEvent::Chunk(chunk))
    }

    fn on_completed(&mut self) -> Result<(), SinkError> {
        self.send(ResponseEvent::Completed)
    }

    fn on_error(&mut self, error: ProxyError) -> Result<(), SinkError> {
        self.send(ResponseEvent::Error(error))
    }
}

/// Deliver a terminal event, containing any failure of the sink itself.
///
/// Returns `false` when the sink errored or panicked. The fault is logged here and
/// cannot be reported any further: the delivery channel is the thing that broke.
pub(crate) fn deliver_terminal(
    sink: &mut dyn ResponseSink,
    request_id: RequestId,
    outcome: Result<(), ProxyError>,
) -> bool {
    let delivered = catch_unwind(AssertUnwindSafe(|| match outcome {
        Ok(()) => sink.on_completed(),
        Err(e) => sink.on_error(e),
    }));

    match delivered {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(%request_id, error = %e, "Failed to forward terminal event to caller");
            false
        }
        Err(_) => {
            tracing::error!(%request_id, "Response sink panicked while receiving terminal event");
            false
        }
    }
}
