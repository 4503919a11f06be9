use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest message accepted either way; the same value is handed to the
/// WebSocket layer so the transport and the codec agree.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 << 20;

/// Rejection message used when the add-in reports an error without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Command failed";

/// Frames the bridge sends to a document session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Command {
        id: String,
        action: String,
        #[serde(default)]
        params: Value,
    },
}

/// Frames a document session sends to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ready {
        #[serde(default, rename = "documentUrl")]
        document_url: Option<String>,
    },
    Response {
        id: String,
        #[serde(default)]
        data: Value,
    },
    Error {
        id: String,
        #[serde(default)]
        error: Option<RemoteError>,
    },
}

/// Error body reported by the add-in. Only `message` drives the rejection;
/// `code`, `debugInfo` and anything else are kept for logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RemoteError {
    pub fn message_or_default(&self) -> &str {
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => message,
            _ => DEFAULT_FAILURE_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}
