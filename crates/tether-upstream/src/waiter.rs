//! Unary consumer: one delivery raced against a timeout.

use std::time::Duration;

use tether_core::errors::GatewayError;
use tether_core::wire::{InboundKind, InboundMessage};
use tether_telemetry::LogContext;
use tracing::Span;

use crate::registry::{Delivery, RegistrationGuard};

pub struct ResponseWaiter {
    span: Span,
}

impl ResponseWaiter {
    pub fn new(log: &LogContext) -> Self {
        Self {
            span: log.component("waiter"),
        }
    }

    /// Wait for the single response of a unary request. The guard is
    /// consumed, so the registration is released exactly once whichever
    /// branch wins, and also when the caller drops this future.
    pub async fn wait(&self, guard: RegistrationGuard, timeout: Duration) -> Result<InboundMessage, GatewayError> {
        let correlation_id = guard.correlation_id().clone();

        let outcome = tokio::select! {
            delivery = guard.recv() => self.settle(delivery, correlation_id.as_str()),
            _ = tokio::time::sleep(timeout) => {
                tracing::error!(
                    parent: &self.span,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for upstream response"
                );
                Err(GatewayError::RequestTimeout {
                    correlation_id: correlation_id.to_string(),
                    after: timeout,
                })
            }
        };

        drop(guard);
        outcome
    }

    fn settle(&self, delivery: Delivery, correlation_id: &str) -> Result<InboundMessage, GatewayError> {
        let message = match delivery {
            Delivery::Message(message) => message,
            Delivery::Overflowed => return Err(GatewayError::ChannelOverflow(correlation_id.to_string())),
            Delivery::Closed => return Err(GatewayError::ConnectionLost),
        };

        match message.kind {
            InboundKind::FullResponse if message.is_success() => Ok(message),
            InboundKind::Chunk => Err(GatewayError::UnexpectedFrame("chunk")),
            InboundKind::StreamEnd => Err(GatewayError::UnexpectedFrame("stream end")),
            _ => {
                let err = message.failure().unwrap_or_else(|| GatewayError::Upstream {
                    status: message.status_code.unwrap_or(500),
                    message: "Unknown error".into(),
                });
                tracing::warn!(
                    parent: &self.span,
                    correlation_id = correlation_id,
                    kind = err.error_kind(),
                    error = %err,
                    "Upstream request failed"
                );
                Err(err)
            }
        }
    }
}
