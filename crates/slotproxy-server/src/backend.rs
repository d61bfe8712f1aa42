//! HTTP backend connector: one reqwest client per payment channel.
//!
//! Each call is a `POST` of the raw payload to the backend URL, carrying the
//! channel and service identity as headers. The response body is relayed chunk
//! by chunk as it arrives.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode, header};

use slotproxy::{
    CallObserver, ChannelId, Code, ConnectError, Connector, Downstream, DownstreamError,
};

use crate::config::BackendConfig;

pub const CHANNEL_HEADER: &str = "x-payment-channel-id";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const SERVICE_HEADER: &str = "x-service-id";
pub const PAYMENT_GROUP_HEADER: &str = "x-payment-group-id";

/// Map a non-success backend status to the code relayed to the caller.
pub fn code_for_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        // Channel out of funds or expired.
        402 => Code::FailedPrecondition,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        408 | 504 => Code::DeadlineExceeded,
        409 => Code::Aborted,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        501 => Code::Unimplemented,
        502 | 503 => Code::Unavailable,
        400..=499 => Code::FailedPrecondition,
        500..=599 => Code::Internal,
        _ => Code::Unknown,
    }
}

fn error_from_reqwest(error: &reqwest::Error) -> DownstreamError {
    let code = if error.is_timeout() {
        Code::DeadlineExceeded
    } else if error.is_connect() {
        Code::Unavailable
    } else if error.is_body() || error.is_decode() {
        Code::Internal
    } else {
        Code::Unknown
    };
    DownstreamError::new(code, error.to_string())
}

pub struct HttpConnector {
    backend: Arc<BackendConfig>,
}

impl HttpConnector {
    pub fn new(backend: BackendConfig) -> Self {
        tracing::info!(
            organization_id = %backend.organization_id,
            service_id = %backend.service_id,
            payment_group_id = %backend.payment_group_id,
            url = %backend.url,
            "Backend service"
        );
        Self {
            backend: Arc::new(backend),
        }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, channel: ChannelId) -> Result<Arc<dyn Downstream>, ConnectError> {
        let mut builder = Client::builder();
        if let Some(timeout) = self.backend.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ConnectError::Channel {
            channel,
            reason: e.to_string(),
        })?;

        Ok(Arc::new(HttpChannel {
            channel,
            client: Mutex::new(Some(client)),
            backend: Arc::clone(&self.backend),
        }))
    }
}

/// Backend handle bound to one payment channel.
///
/// The client (and its connection pool) is dropped on `close`; calls started
/// afterwards fail as unavailable.
pub struct HttpChannel {
    channel: ChannelId,
    client: Mutex<Option<Client>>,
    backend: Arc<BackendConfig>,
}

impl HttpChannel {
    fn client(&self) -> Option<Client> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn request(&self, client: &Client, payload: Bytes) -> RequestBuilder {
        client
            .post(self.backend.url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(CHANNEL_HEADER, self.channel.to_string())
            .header(ORGANIZATION_HEADER, &self.backend.organization_id)
            .header(SERVICE_HEADER, &self.backend.service_id)
            .header(PAYMENT_GROUP_HEADER, &self.backend.payment_group_id)
            .body(payload)
    }
}

#[async_trait]
impl Downstream for HttpChannel {
    fn start(&self, payload: Bytes, observer: CallObserver) {
        match self.client() {
            Some(client) => {
                tokio::spawn(relay(self.request(&client, payload), observer));
            }
            None => observer.on_error(DownstreamError::new(
                Code::Unavailable,
                format!("payment channel {} is closed", self.channel),
            )),
        }
    }

    async fn close(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if client.is_some() {
            tracing::debug!(channel = %self.channel, "Closed backend client");
        }
    }
}

async fn relay(request: RequestBuilder, mut observer: CallObserver) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return observer.on_error(error_from_reqwest(&e)),
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            body
        };
        return observer.on_error(DownstreamError::new(code_for_status(status), message));
    }

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => observer.on_next(chunk),
            Err(e) => return observer.on_error(error_from_reqwest(&e)),
        }
    }
    observer.on_completed();
}
