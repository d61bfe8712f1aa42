//! Transport layer for slotproxy.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{ServerConfig, WireEvent, serve};
