//! Request-side entry points: register, send, then wait or stream.

use std::sync::Arc;
use std::time::Duration;

use tether_core::completion::ChatCompletion;
use tether_core::errors::GatewayError;
use tether_core::ids::CorrelationId;
use tether_core::wire::{InboundMessage, OutboundFrame};
use tether_telemetry::LogContext;
use tracing::Span;

use crate::config::UpstreamConfig;
use crate::registry::{RegistrationGuard, RequestMode, RequestRegistry};
use crate::router::MessageRouter;
use crate::supervisor::ConnectionSupervisor;
use crate::translator::StreamTranslator;
use crate::waiter::ResponseWaiter;

pub struct CompletionGateway {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<RequestRegistry>,
    waiter: ResponseWaiter,
    log: LogContext,
    span: Span,
}

impl CompletionGateway {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, registry: Arc<RequestRegistry>, log: &LogContext) -> Self {
        Self {
            supervisor,
            registry,
            waiter: ResponseWaiter::new(log),
            log: log.clone(),
            span: log.component("gateway"),
        }
    }

    /// Wire registry, router and supervisor together from one config.
    pub fn from_config(config: UpstreamConfig, log: &LogContext) -> Self {
        let registry = Arc::new(RequestRegistry::new(config.channel_capacity, log));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), log));
        let supervisor = Arc::new(ConnectionSupervisor::new(config, Arc::clone(&registry), router, log));
        Self::new(supervisor, registry, log)
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    fn config(&self) -> &UpstreamConfig {
        self.supervisor.config()
    }

    /// Register `id`, then send `frame`. The registration always exists
    /// before the frame hits the wire; a failed send releases it.
    async fn dispatch(
        &self,
        id: &CorrelationId,
        frame: &OutboundFrame,
        mode: RequestMode,
    ) -> Result<RegistrationGuard, GatewayError> {
        if &frame.request_id != id {
            return Err(GatewayError::Protocol(format!(
                "frame requestId {} does not match correlation id {id}",
                frame.request_id
            )));
        }
        if self.supervisor.is_exhausted() {
            return Err(GatewayError::ExhaustedRetries {
                retries: self.supervisor.retry_count(),
            });
        }

        let guard = self.registry.register_guarded(id, mode);
        if let Err(e) = self.supervisor.send(frame).await {
            tracing::error!(parent: &self.span, correlation_id = %id, error = %e, "Failed to send request upstream");
            return Err(e);
        }
        Ok(guard)
    }

    /// Unary completion: one response or one error.
    pub async fn handle_unary(&self, id: &CorrelationId, frame: &OutboundFrame) -> Result<ChatCompletion, GatewayError> {
        tracing::info!(parent: &self.span, correlation_id = %id, method = %frame.method, "Processing unary request");
        let model = model_of(frame);
        let guard = self.dispatch(id, frame, RequestMode::Unary).await?;
        let response = self.waiter.wait(guard, self.config().request_timeout).await?;
        Ok(ChatCompletion::from_response(id, &model, &response))
    }

    /// Streaming completion: a lazy sequence of chunk events ending in a
    /// terminal marker.
    pub async fn handle_stream(&self, id: &CorrelationId, frame: &OutboundFrame) -> Result<StreamTranslator, GatewayError> {
        tracing::info!(parent: &self.span, correlation_id = %id, method = %frame.method, "Processing stream request");
        let model = model_of(frame);
        let guard = self.dispatch(id, frame, RequestMode::Stream).await?;
        Ok(StreamTranslator::new(
            guard,
            model,
            self.config().stream_idle_timeout,
            &self.log,
        ))
    }

    /// Auxiliary unary call with a fresh correlation id.
    pub async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<InboundMessage, GatewayError> {
        let id = CorrelationId::new();
        let frame = OutboundFrame::new(method, args, id.clone());
        let guard = self.dispatch(&id, &frame, RequestMode::Unary).await?;
        self.waiter.wait(guard, timeout).await
    }
}

fn model_of(frame: &OutboundFrame) -> String {
    frame
        .args
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string()
}
