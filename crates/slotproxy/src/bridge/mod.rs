//! Call bridge between an asynchronous, chunked downstream call and the worker
//! that owns it.
//!
//! # Architecture
//!
//! - **sink**: [`ResponseSink`], the caller's side of a request (chunks + one terminal)
//! - **call**: [`CallBridge`] / [`CallObserver`], which forward downstream events to
//!   the sink and wake the worker once the terminal event has been delivered

mod call;
mod sink;

pub use call::{CallBridge, CallObserver, Terminal};
pub use sink::{ChannelSink, ResponseEvent, ResponseSink, SinkError};

pub(crate) use sink::deliver_terminal;
