//! Line-delimited JSON events streamed back on `POST /process`.
//!
//! ```text
//! {"type":"chunk","data":"<base64>"}
//! {"type":"completed"}
//! {"type":"error","code":"unavailable","message":"..."}
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bridge::ResponseEvent;
use crate::downstream::Code;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed event line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("chunk data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Chunk { data: String },
    Completed,
    Error { code: Code, message: String },
}

impl WireEvent {
    pub fn chunk(data: &[u8]) -> Self {
        Self::Chunk {
            data: STANDARD.encode(data),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }

    /// One serialized line, newline included.
    pub fn to_line(&self) -> Bytes {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|e| {
            // Only string and enum fields; serialization cannot fail in practice.
            tracing::error!(error = %e, "Failed to serialize wire event");
            br#"{"type":"error","code":"internal","message":"unserializable event"}"#.to_vec()
        });
        line.push(b'\n');
        Bytes::from(line)
    }

    pub fn parse_line(line: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(line)?)
    }

    /// Raw bytes of a chunk event; `None` for terminal events.
    pub fn decode_chunk(&self) -> Result<Option<Vec<u8>>, WireError> {
        match self {
            Self::Chunk { data } => Ok(Some(STANDARD.decode(data)?)),
            _ => Ok(None),
        }
    }
}

impl From<ResponseEvent> for WireEvent {
    fn from(event: ResponseEvent) -> Self {
        match event {
            ResponseEvent::Chunk(bytes) => Self::chunk(&bytes),
            ResponseEvent::Completed => Self::Completed,
            ResponseEvent::Error(error) => Self::Error {
                code: error.code(),
                message: error.message(),
            },
        }
    }
}
