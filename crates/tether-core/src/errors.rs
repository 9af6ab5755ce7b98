use std::time::Duration;

/// Typed error hierarchy for the upstream gateway.
/// Connection-level errors are recovered by the supervisor; request-level
/// errors are surfaced to the caller that owns the correlation id.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    // Connection level
    #[error("upstream connection error: {0}")]
    Transient(String),
    #[error("reconnect budget exhausted after {retries} attempts")]
    ExhaustedRetries { retries: u32 },
    #[error("upstream connection lost")]
    ConnectionLost,
    #[error("gateway is shutting down")]
    ShuttingDown,

    // Frame level, logged and dropped by the router
    #[error("malformed upstream frame: {0}")]
    Protocol(String),
    #[error("no pending request for correlation id {0}")]
    CorrelationMiss(String),

    // Request level
    #[error("Request timeout: {correlation_id}")]
    RequestTimeout {
        correlation_id: String,
        after: Duration,
    },
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("delivery channel overflowed for {0}")]
    ChannelOverflow(String),
    #[error("unexpected {0} frame on unary request")]
    UnexpectedFrame(&'static str),
}

impl GatewayError {
    /// HTTP status the caller should see for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RequestTimeout { .. } => 408,
            Self::Upstream { status, .. } if (500..=599).contains(status) => *status,
            Self::Upstream { .. } => 500,
            Self::Transient(_)
            | Self::ExhaustedRetries { .. }
            | Self::ConnectionLost
            | Self::ShuttingDown => 503,
            Self::Protocol(_)
            | Self::CorrelationMiss(_)
            | Self::ChannelOverflow(_)
            | Self::UnexpectedFrame(_) => 500,
        }
    }

    /// Whether the supervisor owns recovery for this error.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ExhaustedRetries { .. } | Self::ConnectionLost | Self::ShuttingDown
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient_connection_error",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::ConnectionLost => "connection_lost",
            Self::ShuttingDown => "shutting_down",
            Self::Protocol(_) => "protocol_error",
            Self::CorrelationMiss(_) => "correlation_miss",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::ChannelOverflow(_) => "channel_overflow",
            Self::UnexpectedFrame(_) => "unexpected_frame",
        }
    }
}
