//! Upstream wire protocol: JSON text frames over the shared WebSocket.
//!
//! Outbound: `{ method, args, requestId }`.
//! Inbound frames are classified by the fields they carry:
//! `isStreamEnd: true` → stream end, `chunk` → stream chunk,
//! `code == 200` → full response, any other `code` → upstream error.

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::CorrelationId;

/// Status code the upstream uses for success.
pub const STATUS_OK: u16 = 200;

/// A correlated request frame sent to the upstream.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OutboundFrame {
    pub method: String,
    pub args: serde_json::Value,
    #[serde(rename = "requestId")]
    pub request_id: CorrelationId,
}

impl OutboundFrame {
    pub fn new(method: impl Into<String>, args: serde_json::Value, request_id: CorrelationId) -> Self {
        Self {
            method: method.into(),
            args,
            request_id,
        }
    }

    pub fn to_text(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundKind {
    FullResponse,
    Chunk,
    StreamEnd,
    UpstreamError,
    /// Synthesized locally when the shared connection drops.
    ConnectionLost,
}

impl InboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullResponse => "full_response",
            Self::Chunk => "chunk",
            Self::StreamEnd => "stream_end",
            Self::UpstreamError => "upstream_error",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

/// One decoded inbound frame, owned by exactly one delivery channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub correlation_id: CorrelationId,
    pub kind: InboundKind,
    /// Present for `FullResponse` and `UpstreamError` only.
    pub status_code: Option<u16>,
    /// Response text, chunk text, or the upstream error message.
    pub payload: String,
    pub tokens_burned: Option<u64>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    code: Option<u16>,
    response: Option<String>,
    message: Option<String>,
    chunk: Option<String>,
    #[serde(rename = "isStreamEnd", default)]
    is_stream_end: bool,
    tokens_burned: Option<u64>,
}

impl InboundMessage {
    /// Decode and classify a raw text frame.
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))?;

        let correlation_id = match raw.request_id {
            Some(id) if !id.is_empty() => CorrelationId::from_raw(id),
            _ => return Err(GatewayError::Protocol("frame has no requestId".into())),
        };

        let message = if raw.is_stream_end {
            Self {
                correlation_id,
                kind: InboundKind::StreamEnd,
                status_code: None,
                payload: String::new(),
                tokens_burned: raw.tokens_burned,
            }
        } else if let Some(chunk) = raw.chunk {
            Self::chunk(correlation_id, chunk)
        } else if let Some(code) = raw.code {
            if code == STATUS_OK {
                Self {
                    correlation_id,
                    kind: InboundKind::FullResponse,
                    status_code: Some(code),
                    payload: raw.response.unwrap_or_default(),
                    tokens_burned: raw.tokens_burned,
                }
            } else {
                Self {
                    correlation_id,
                    kind: InboundKind::UpstreamError,
                    status_code: Some(code),
                    payload: raw.message.unwrap_or_else(|| "Unknown error".into()),
                    tokens_burned: None,
                }
            }
        } else {
            return Err(GatewayError::Protocol(format!(
                "frame for {correlation_id} carries no code, chunk or isStreamEnd"
            )));
        };

        Ok(message)
    }

    pub fn chunk(correlation_id: CorrelationId, text: impl Into<String>) -> Self {
        Self {
            correlation_id,
            kind: InboundKind::Chunk,
            status_code: None,
            payload: text.into(),
            tokens_burned: None,
        }
    }

    pub fn stream_end(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            kind: InboundKind::StreamEnd,
            status_code: None,
            payload: String::new(),
            tokens_burned: None,
        }
    }

    pub fn connection_lost(correlation_id: CorrelationId, reason: impl Into<String>) -> Self {
        Self {
            correlation_id,
            kind: InboundKind::ConnectionLost,
            status_code: None,
            payload: reason.into(),
            tokens_burned: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == InboundKind::FullResponse && self.status_code == Some(STATUS_OK)
    }

    /// Error to surface for a failure frame; `None` for data-carrying kinds.
    pub fn failure(&self) -> Option<GatewayError> {
        match self.kind {
            InboundKind::UpstreamError => Some(GatewayError::Upstream {
                status: self.status_code.unwrap_or(500),
                message: self.payload.clone(),
            }),
            InboundKind::ConnectionLost => Some(GatewayError::ConnectionLost),
            _ => None,
        }
    }
}
