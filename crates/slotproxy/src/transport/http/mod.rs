//! HTTP transport: NDJSON response streaming over axum.

mod routes;
mod server;
mod wire;

pub use routes::{ErrorBody, routes, status_for};
pub use server::{DEFAULT_MAX_INBOUND_MESSAGE_SIZE, DEFAULT_PORT, ServerConfig, serve};
pub use wire::{NDJSON_CONTENT_TYPE, WireError, WireEvent};
