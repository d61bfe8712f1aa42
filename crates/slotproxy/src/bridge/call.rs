//! CallBridge: one downstream call as a single awaitable unit of work.
//!
//! The observer side is handed to the downstream. Its terminal methods consume
//! it, so exactly one terminal event can reach the caller's sink; dropping it
//! without one delivers an internal error instead. The bridge side is kept by
//! the worker, which suspends in [`CallBridge::await_terminal`] until the
//! terminal event has been forwarded.

use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::sink::{ResponseSink, deliver_terminal};
use crate::downstream::{Code, DownstreamError};
use crate::request::RequestId;
use crate::slot::ChannelId;
use crate::status::ProxyError;

/// How a forwarded call ended, as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Completed { chunks: usize, bytes: usize },
    /// `expected` is true for caller/stream cancellation.
    Errored { code: Code, expected: bool },
    /// The completion signal was dropped without firing.
    Abandoned,
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Worker side of a bridged call.
pub struct CallBridge {
    request_id: RequestId,
    channel: ChannelId,
    terminal_rx: oneshot::Receiver<Terminal>,
}

impl CallBridge {
    pub fn new(
        request_id: RequestId,
        channel: ChannelId,
        sink: Box<dyn ResponseSink>,
    ) -> (Self, CallObserver) {
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let bridge = Self {
            request_id,
            channel,
            terminal_rx,
        };
        let observer = CallObserver {
            request_id,
            channel,
            inner: Some(ObserverInner {
                sink,
                terminal_tx,
                chunks: 0,
                bytes: 0,
                sink_broken: false,
            }),
        };
        (bridge, observer)
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the terminal event. Consumes the bridge: one wait per request.
    pub async fn await_terminal(self) -> Terminal {
        match self.terminal_rx.await {
            Ok(terminal) => terminal,
            Err(_) => {
                tracing::error!(
                    request_id = %self.request_id,
                    channel = %self.channel,
                    "Completion signal dropped without firing"
                );
                Terminal::Abandoned
            }
        }
    }
}

struct ObserverInner {
    sink: Box<dyn ResponseSink>,
    terminal_tx: oneshot::Sender<Terminal>,
    chunks: usize,
    bytes: usize,
    sink_broken: bool,
}

/// Downstream side of a bridged call.
pub struct CallObserver {
    request_id: RequestId,
    channel: ChannelId,
    inner: Option<ObserverInner>,
}

impl CallObserver {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Forward one chunk to the caller, unmodified and unbuffered.
    pub fn on_next(&mut self, chunk: Bytes) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };

        tracing::debug!(request_id = %self.request_id, bytes = chunk.len(), "Result chunk");
        inner.chunks += 1;
        inner.bytes += chunk.len();

        // Once the caller's side is gone there is nobody left to stream to; keep
        // counting until the terminal event frees the slot.
        if inner.sink_broken {
            return;
        }

        let forwarded = catch_unwind(AssertUnwindSafe(|| inner.sink.on_chunk(chunk)));
        match forwarded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.sink_broken = true;
                tracing::warn!(
                    request_id = %self.request_id,
                    error = %e,
                    "Failed to forward chunk to caller, dropping the rest of the response"
                );
            }
            Err(_) => {
                inner.sink_broken = true;
                tracing::error!(
                    request_id = %self.request_id,
                    "Response sink panicked while receiving chunk"
                );
            }
        }
    }

    pub fn on_completed(mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::info!(
                request_id = %self.request_id,
                channel = %self.channel,
                chunks = inner.chunks,
                bytes = inner.bytes,
                "Request completed"
            );
            let terminal = Terminal::Completed {
                chunks: inner.chunks,
                bytes: inner.bytes,
            };
            finish(self.request_id, inner, Ok(()), terminal);
        }
    }

    pub fn on_error(mut self, error: DownstreamError) {
        if let Some(inner) = self.inner.take() {
            let expected = error.is_cancellation();
            if expected {
                tracing::info!(
                    request_id = %self.request_id,
                    channel = %self.channel,
                    code = %error.code(),
                    "Request cancelled (expected): {}",
                    error.message()
                );
            } else {
                tracing::error!(
                    request_id = %self.request_id,
                    channel = %self.channel,
                    code = %error.code(),
                    "Request failed: {}",
                    error.message()
                );
            }
            let terminal = Terminal::Errored {
                code: error.code(),
                expected,
            };
            finish(
                self.request_id,
                inner,
                Err(ProxyError::Downstream(error)),
                terminal,
            );
        }
    }
}

impl Drop for CallObserver {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::error!(
                request_id = %self.request_id,
                channel = %self.channel,
                "Downstream released call without a terminal event"
            );
            let error = DownstreamError::new(
                Code::Internal,
                "downstream call ended without a terminal event",
            );
            let terminal = Terminal::Errored {
                code: error.code(),
                expected: false,
            };
            finish(self.request_id, inner, Err(error.into()), terminal);
        }
    }
}

fn finish(
    request_id: RequestId,
    inner: ObserverInner,
    outcome: Result<(), ProxyError>,
    terminal: Terminal,
) {
    let ObserverInner {
        mut sink,
        terminal_tx,
        ..
    } = inner;

    deliver_terminal(sink.as_mut(), request_id, outcome);

    // The worker may already be gone (aborted at shutdown).
    if terminal_tx.send(terminal).is_err() {
        tracing::debug!(%request_id, "Worker no longer waiting for terminal event");
    }
}
