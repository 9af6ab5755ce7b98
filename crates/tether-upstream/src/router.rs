//! Inbound demultiplexing: frame → correlation id → pending request channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_core::errors::GatewayError;
use tether_core::wire::{InboundKind, InboundMessage};
use tether_telemetry::LogContext;
use tokio::sync::mpsc::error::TrySendError;
use tracing::Span;

use crate::registry::RequestRegistry;

pub struct MessageRouter {
    registry: Arc<RequestRegistry>,
    protocol_errors: AtomicU64,
    misses: AtomicU64,
    span: Span,
}

impl MessageRouter {
    pub fn new(registry: Arc<RequestRegistry>, log: &LogContext) -> Self {
        Self {
            registry,
            protocol_errors: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            span: log.component("router"),
        }
    }

    /// Decode one raw text frame and route it. Malformed frames are logged
    /// and dropped; the error is returned for the caller's bookkeeping only.
    pub fn route_frame(&self, text: &str) -> Result<(), GatewayError> {
        match InboundMessage::decode(text) {
            Ok(message) => self.route(message),
            Err(e) => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    parent: &self.span,
                    error = %e,
                    frame = %preview(text),
                    "Dropping malformed upstream frame"
                );
                Err(e)
            }
        }
    }

    /// Deliver a decoded message to its pending request without blocking.
    pub fn route(&self, message: InboundMessage) -> Result<(), GatewayError> {
        let id = message.correlation_id.clone();
        let kind = message.kind;

        let Some(entry) = self.registry.get(&id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                parent: &self.span,
                correlation_id = %id,
                kind = kind.as_str(),
                "No pending request for frame, dropping"
            );
            return Err(GatewayError::CorrelationMiss(id.to_string()));
        };

        match entry.try_deliver(message) {
            Ok(()) => {
                tracing::debug!(parent: &self.span, correlation_id = %id, kind = kind.as_str(), "Routed frame");
                if kind == InboundKind::StreamEnd {
                    self.registry.release(&entry);
                    tracing::debug!(parent: &self.span, correlation_id = %id, "Stream end, unregistered");
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.registry.record_drop();
                tracing::error!(
                    parent: &self.span,
                    correlation_id = %id,
                    kind = kind.as_str(),
                    dropped_total = dropped,
                    "Delivery channel full, dropping frame"
                );
                Err(GatewayError::ChannelOverflow(id.to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                // Released between lookup and push.
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(parent: &self.span, correlation_id = %id, kind = kind.as_str(), "Request already released, dropping frame");
                Err(GatewayError::CorrelationMiss(id.to_string()))
            }
        }
    }

    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// First 100 chars of a frame, for logs.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
