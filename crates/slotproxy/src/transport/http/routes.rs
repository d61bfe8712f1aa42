//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::wire::{NDJSON_CONTENT_TYPE, WireEvent};
use crate::bridge::{ChannelSink, ResponseEvent};
use crate::downstream::{Code, DownstreamError};
use crate::health::HealthSnapshot;
use crate::orchestrator::{Admission, ProxyOrchestrator};
use crate::status::ProxyError;

/// Body of a non-streamed error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: Code,
    pub message: String,
}

/// HTTP status used when a request fails before any chunk was sent.
pub fn status_for(code: Code) -> StatusCode {
    match code {
        // nginx's "client closed request"
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Aborted => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unknown | Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &ProxyError) -> Response {
    let code = error.code();
    (
        status_for(code),
        Json(ErrorBody {
            code,
            message: error.message(),
        }),
    )
        .into_response()
}

async fn health_check(State(proxy): State<Arc<ProxyOrchestrator>>) -> Json<HealthSnapshot> {
    Json(proxy.health())
}

async fn metrics(State(proxy): State<Arc<ProxyOrchestrator>>) -> Response {
    match proxy.metrics().encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn shutdown(State(proxy): State<Arc<ProxyOrchestrator>>) -> impl IntoResponse {
    proxy.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

/// Forward the body through a payment channel and stream the result back.
///
/// The status line is held until the first event arrives, so a request that
/// fails before producing output gets a plain error response.
async fn process(State(proxy): State<Arc<ProxyOrchestrator>>, body: Bytes) -> Response {
    let (sink, mut rx) = ChannelSink::new();
    if let Admission::Rejected(_, error) = proxy.submit(body, sink) {
        return error_response(&error);
    }

    let first = match rx.recv().await {
        Some(ResponseEvent::Error(error)) => return error_response(&error),
        Some(event) => event,
        None => {
            return error_response(&ProxyError::Downstream(DownstreamError::new(
                Code::Internal,
                "response ended without a terminal event",
            )));
        }
    };

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(event_stream(first, rx)),
    )
        .into_response()
}

/// `first`, then everything after it up to and including the terminal event.
fn event_stream(
    first: ResponseEvent,
    rx: mpsc::UnboundedReceiver<ResponseEvent>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold(
        (Some(first), rx, false),
        |(pending, mut rx, finished)| async move {
            if finished {
                return None;
            }
            let event = match pending {
                Some(event) => event,
                None => rx.recv().await?,
            };
            let finished = event.is_terminal();
            let line = WireEvent::from(event).to_line();
            Some((Ok(line), (None, rx, finished)))
        },
    )
}

pub fn routes(proxy: Arc<ProxyOrchestrator>, max_inbound_message_size: usize) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/metrics", get(metrics))
        .route("/shutdown", post(shutdown))
        .route(
            "/process",
            post(process).layer(DefaultBodyLimit::max(max_inbound_message_size)),
        )
        .with_state(proxy)
}
