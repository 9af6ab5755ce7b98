//! Streaming consumer: turns a pending request's deliveries into output
//! events, with an idle timeout on every pull.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tether_core::completion::ChatCompletionChunk;
use tether_core::errors::GatewayError;
use tether_core::wire::InboundKind;
use tether_telemetry::LogContext;
use tokio::time::{Instant, Sleep};
use tracing::Span;

use crate::registry::{Delivery, RegistrationGuard};

/// Events yielded by a [`StreamTranslator`].
///
/// Ordering contract: `Chunk*` followed by exactly one of `Done`,
/// `Timeout` or `Failed`, then the stream ends.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Done,
    Timeout,
    Failed(GatewayError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Chunk(chunk) => chunk.choices.first().map(|c| c.delta.content.as_str()),
            _ => None,
        }
    }

    /// Payload of the SSE `data:` field.
    pub fn sse_data(&self) -> String {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Done => "[DONE]".into(),
            Self::Timeout => "[TIMEOUT]".into(),
            Self::Failed(err) => serde_json::json!({
                "error": {
                    "message": err.to_string(),
                    "type": err.error_kind(),
                    "code": err.http_status(),
                }
            })
            .to_string(),
        }
    }

    /// Full SSE frame, `data: <payload>\n\n`.
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.sse_data())
    }
}

type PendingRecv = Pin<Box<dyn Future<Output = Delivery> + Send>>;

/// Lazy, finite sequence of [`StreamEvent`]s for one stream request.
/// Dropping it before the terminal event releases the registration.
pub struct StreamTranslator {
    guard: Option<RegistrationGuard>,
    model: String,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    recv: Option<PendingRecv>,
    emitted: usize,
    span: Span,
}

impl StreamTranslator {
    pub fn new(guard: RegistrationGuard, model: impl Into<String>, idle_timeout: Duration, log: &LogContext) -> Self {
        Self {
            guard: Some(guard),
            model: model.into(),
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            recv: None,
            emitted: 0,
            span: log.component("translator"),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    fn translate(&self, guard: &RegistrationGuard, delivery: Delivery) -> StreamEvent {
        let id = guard.correlation_id();
        let message = match delivery {
            Delivery::Message(message) => message,
            Delivery::Overflowed => return StreamEvent::Failed(GatewayError::ChannelOverflow(id.to_string())),
            Delivery::Closed => return StreamEvent::Failed(GatewayError::ConnectionLost),
        };

        match message.kind {
            // A stream request answered in one piece still reaches the
            // client as a chunk.
            InboundKind::Chunk | InboundKind::FullResponse => {
                StreamEvent::Chunk(ChatCompletionChunk::new(id, &self.model, message.payload))
            }
            InboundKind::StreamEnd => StreamEvent::Done,
            InboundKind::UpstreamError | InboundKind::ConnectionLost => {
                let err = message.failure().unwrap_or(GatewayError::ConnectionLost);
                tracing::warn!(parent: &self.span, correlation_id = %id, error = %err, "Stream failed");
                StreamEvent::Failed(err)
            }
        }
    }

    fn finish(&mut self) {
        self.recv = None;
        self.guard = None;
    }
}

impl Stream for StreamTranslator {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(guard) = this.guard.as_ref() else {
            return Poll::Ready(None);
        };

        // Start of a new pull: arm the receive and restart the idle clock.
        if this.recv.is_none() {
            let entry = Arc::clone(guard.entry());
            this.recv = Some(Box::pin(async move { entry.recv().await }));
            let deadline = Instant::now() + this.idle_timeout;
            this.deadline.as_mut().reset(deadline);
        }

        if let Some(recv) = this.recv.as_mut() {
            if let Poll::Ready(delivery) = recv.as_mut().poll(cx) {
                this.recv = None;
                let event = this.translate(guard, delivery);
                if event.is_terminal() {
                    tracing::debug!(
                        parent: &this.span,
                        correlation_id = %guard.correlation_id(),
                        chunks = this.emitted,
                        "Stream finished"
                    );
                    this.finish();
                } else {
                    this.emitted += 1;
                }
                return Poll::Ready(Some(event));
            }
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::warn!(
                parent: &this.span,
                correlation_id = %guard.correlation_id(),
                idle_secs = this.idle_timeout.as_secs(),
                "Stream idle timeout"
            );
            this.finish();
            return Poll::Ready(Some(StreamEvent::Timeout));
        }

        Poll::Pending
    }
}

impl Drop for StreamTranslator {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.as_ref() {
            tracing::debug!(
                parent: &self.span,
                correlation_id = %guard.correlation_id(),
                "Stream consumer went away before the end"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tether_core::ids::CorrelationId;

    use crate::registry::{RequestMode, RequestRegistry};
    use crate::router::MessageRouter;

    fn setup() -> (Arc<RequestRegistry>, MessageRouter, LogContext) {
        let log = LogContext::detached();
        let registry = Arc::new(RequestRegistry::new(8, &log));
        let router = MessageRouter::new(Arc::clone(&registry), &log);
        (registry, router, log)
    }

    fn id(s: &str) -> CorrelationId {
        CorrelationId::from_raw(s)
    }

    #[tokio::test]
    async fn chunks_then_done() {
        let (registry, router, log) = setup();
        let guard = registry.register_guarded(&id("r2"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "gpt-4o", Duration::from_secs(5), &log);

        router.route_frame(r#"{"requestId":"r2","chunk":"Hel"}"#).unwrap();
        router.route_frame(r#"{"requestId":"r2","chunk":"lo"}"#).unwrap();
        router.route_frame(r#"{"requestId":"r2","isStreamEnd":true}"#).unwrap();

        let events: Vec<StreamEvent> = (&mut stream).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].content(), Some("Hel"));
        assert_eq!(events[1].content(), Some("lo"));
        assert_eq!(events[2], StreamEvent::Done);
        assert_eq!(events[2].sse_frame(), "data: [DONE]\n\n");

        assert!(stream.next().await.is_none(), "never yields after done");
        assert!(!registry.contains(&id("r2")));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_emits_marker_and_unregisters() {
        let (registry, _router, log) = setup();
        let guard = registry.register_guarded(&id("r3"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "gpt-4o", Duration::from_secs(30), &log);

        assert_eq!(stream.next().await, Some(StreamEvent::Timeout));
        assert_eq!(StreamEvent::Timeout.sse_frame(), "data: [TIMEOUT]\n\n");
        assert!(stream.next().await.is_none());
        assert!(!registry.contains(&id("r3")));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_restarts_per_pull() {
        let (registry, router, log) = setup();
        let guard = registry.register_guarded(&id("r4"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "m", Duration::from_secs(10), &log);

        tokio::time::advance(Duration::from_secs(8)).await;
        router.route_frame(r#"{"requestId":"r4","chunk":"a"}"#).unwrap();
        assert_eq!(stream.next().await.unwrap().content(), Some("a"));

        tokio::time::advance(Duration::from_secs(8)).await;
        router.route_frame(r#"{"requestId":"r4","chunk":"b"}"#).unwrap();
        assert_eq!(stream.next().await.unwrap().content(), Some("b"));
    }

    #[tokio::test]
    async fn dropping_stream_releases_registration() {
        let (registry, router, log) = setup();
        let guard = registry.register_guarded(&id("r5"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "m", Duration::from_secs(30), &log);

        router.route_frame(r#"{"requestId":"r5","chunk":"x"}"#).unwrap();
        assert!(stream.next().await.is_some());
        assert!(registry.contains(&id("r5")));

        drop(stream);
        assert!(!registry.contains(&id("r5")));
    }

    #[tokio::test]
    async fn upstream_error_is_terminal() {
        let (registry, router, log) = setup();
        let guard = registry.register_guarded(&id("r6"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "m", Duration::from_secs(30), &log);

        router
            .route_frame(r#"{"requestId":"r6","code":500,"message":"boom"}"#)
            .unwrap();

        let event = stream.next().await.unwrap();
        assert!(event.is_terminal());
        let data: serde_json::Value = serde_json::from_str(&event.sse_data()).unwrap();
        assert_eq!(data["error"]["message"], "boom");
        assert_eq!(data["error"]["type"], "upstream_error");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn connection_loss_ends_stream() {
        let (registry, _router, log) = setup();
        let guard = registry.register_guarded(&id("r7"), RequestMode::Stream);
        let mut stream = StreamTranslator::new(guard, "m", Duration::from_secs(30), &log);

        registry.fail_all("socket closed");
        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Failed(GatewayError::ConnectionLost))
        );
        assert!(stream.is_finished());
    }

    #[test]
    fn chunk_frame_is_openai_shaped() {
        let event = StreamEvent::Chunk(ChatCompletionChunk::new(&id("r8"), "gpt-4o", "Hel"));
        let frame = event.sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        let data: serde_json::Value = serde_json::from_str(&event.sse_data()).unwrap();
        assert_eq!(data["object"], "chat.completion.chunk");
        assert_eq!(data["model"], "gpt-4o");
        assert_eq!(data["choices"][0]["delta"]["content"], "Hel");
    }
}
