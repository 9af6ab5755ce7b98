//! Owner of the single upstream WebSocket connection.
//!
//! One receive loop reads the socket and hands every frame to the
//! [`MessageRouter`]. Outbound frames go through one async mutex around the
//! sink, so concurrent senders queue instead of interleaving partial frames.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::errors::GatewayError;
use tether_core::wire::OutboundFrame;
use tether_telemetry::LogContext;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::config::UpstreamConfig;
use crate::registry::RequestRegistry;
use crate::router::MessageRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

/// Write half of one physical connection.
struct Writer {
    session: u64,
    sink: WsWriter,
    dropped: CancellationToken,
}

/// Read half of one physical connection, waiting for the receive loop.
struct Session {
    id: u64,
    reader: WsReader,
    dropped: CancellationToken,
}

pub struct ConnectionSupervisor {
    config: UpstreamConfig,
    registry: Arc<RequestRegistry>,
    router: Arc<MessageRouter>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<Writer>>,
    pending_session: parking_lot::Mutex<Option<Session>>,
    session_ready: Notify,
    connect_lock: Mutex<()>,
    current_session: AtomicU64,
    /// Highest session whose loss has already been handled.
    dropped_session: AtomicU64,
    retries: AtomicU32,
    shutdown: CancellationToken,
    receive_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ConnectionSupervisor {
    pub fn new(
        config: UpstreamConfig,
        registry: Arc<RequestRegistry>,
        router: Arc<MessageRouter>,
        log: &LogContext,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry,
            router,
            state,
            writer: Mutex::new(None),
            pending_session: parking_lot::Mutex::new(None),
            session_ready: Notify::new(),
            connect_lock: Mutex::new(()),
            current_session: AtomicU64::new(0),
            dropped_session: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            receive_loop: parking_lot::Mutex::new(None),
            span: log.component("supervisor"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Reconnect budget spent; only an explicit `connect()` revives the link.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count() >= self.config.max_retries
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(parent: &self.span, from = prev.as_str(), to = next.as_str(), "Connection state changed");
        }
    }

    /// Perform the upstream handshake. Returns immediately when already
    /// connected; concurrent callers share one attempt. A failure counts
    /// against the reconnect budget.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.handshake(true).await
    }

    async fn handshake(&self, charge_budget: bool) -> Result<(), GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        let _attempt = self.connect_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        tracing::info!(parent: &self.span, url = %self.config.url, "Connecting to upstream");

        let handshake = tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, connect_async(self.config.url.as_str())) => result,
            _ = self.shutdown.cancelled() => {
                tracing::info!(parent: &self.span, "Handshake abandoned, shutting down");
                return Err(GatewayError::ShuttingDown);
            }
        };
        let mut ws = match handshake {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(self.handshake_failed(e.to_string(), charge_budget)),
            Err(_) => {
                return Err(self.handshake_failed(
                    format!("handshake timed out after {}s", self.config.connect_timeout.as_secs()),
                    charge_budget,
                ))
            }
        };

        // `close()` may have run while the handshake was in flight.
        if self.shutdown.is_cancelled() {
            let _ = ws.close(None).await;
            return Err(GatewayError::ShuttingDown);
        }

        let (sink, reader) = ws.split();
        let session = self.current_session.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped = CancellationToken::new();

        *self.writer.lock().await = Some(Writer {
            session,
            sink,
            dropped: dropped.clone(),
        });
        *self.pending_session.lock() = Some(Session {
            id: session,
            reader,
            dropped,
        });

        self.retries.store(0, Ordering::Release);
        self.set_state(ConnectionState::Connected);
        self.session_ready.notify_one();
        tracing::info!(parent: &self.span, session = session, "Upstream connection established");
        Ok(())
    }

    fn handshake_failed(&self, reason: String, charge_budget: bool) -> GatewayError {
        let retries = if charge_budget {
            self.retries.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.retry_count()
        };
        self.set_state(ConnectionState::Disconnected);
        tracing::warn!(
            parent: &self.span,
            retries = retries,
            max_retries = self.config.max_retries,
            error = %reason,
            "Upstream handshake failed"
        );
        GatewayError::Transient(reason)
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), GatewayError> {
        let text = frame.to_text()?;
        self.send_text(frame.request_id.as_str(), text).await
    }

    /// Write one frame. Connects first when disconnected; fails fast once
    /// the reconnect budget is exhausted. Only the receive loop's paced
    /// attempts spend that budget, so a burst of sends during an outage
    /// cannot exhaust it.
    pub async fn send_text(&self, correlation_id: &str, text: String) -> Result<(), GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        if self.is_exhausted() {
            let retries = self.retry_count();
            tracing::warn!(parent: &self.span, correlation_id = correlation_id, "Send refused, reconnect budget exhausted");
            return Err(GatewayError::ExhaustedRetries { retries });
        }
        if self.state() != ConnectionState::Connected {
            self.handshake(false).await?;
        }

        let mut writer = self.writer.lock().await;
        let Some(active) = writer.as_mut() else {
            return Err(GatewayError::Transient("connection not available".into()));
        };

        let len = text.len();
        match active.sink.send(Message::Text(text.into())).await {
            Ok(()) => {
                tracing::debug!(parent: &self.span, correlation_id = correlation_id, bytes = len, "Sent frame");
                Ok(())
            }
            Err(e) => {
                let broken = writer.take();
                drop(writer);
                tracing::error!(parent: &self.span, correlation_id = correlation_id, error = %e, "Upstream write failed");
                if let Some(broken) = broken {
                    broken.dropped.cancel();
                    self.connection_dropped(broken.session, "write failure");
                }
                Err(GatewayError::Transient(e.to_string()))
            }
        }
    }

    /// Spawn the receive loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.receive_loop.lock();
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { this.run_receive_loop().await }));
    }

    async fn run_receive_loop(self: Arc<Self>) {
        tracing::info!(parent: &self.span, "Receive loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let session = self.pending_session.lock().take();
            if let Some(session) = session {
                self.read_session(session).await;
                continue;
            }

            if self.is_exhausted() {
                tracing::error!(
                    parent: &self.span,
                    retries = self.retry_count(),
                    "Reconnect budget exhausted, waiting for explicit connect"
                );
                tokio::select! {
                    _ = self.session_ready.notified() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            tokio::select! {
                _ = self.session_ready.notified() => continue,
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            if let Err(e) = self.connect().await {
                tracing::warn!(parent: &self.span, error = %e, kind = e.error_kind(), "Reconnect attempt failed");
            }
        }
        tracing::info!(parent: &self.span, "Receive loop stopped");
    }

    async fn read_session(&self, mut session: Session) {
        let reason = loop {
            let next = tokio::select! {
                next = session.reader.next() => next,
                _ = session.dropped.cancelled() => break "write failure",
                _ = self.shutdown.cancelled() => return,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.retries.store(0, Ordering::Release);
                    let _ = self.router.route_frame(text.as_str());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    self.retries.store(0, Ordering::Release);
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            let _ = self.router.route_frame(text);
                        }
                        Err(e) => {
                            tracing::error!(parent: &self.span, error = %e, "Dropping non-UTF-8 binary frame");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::warn!(parent: &self.span, frame = ?frame, "Upstream closed the connection");
                    break "peer close";
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(parent: &self.span, error = %e, "Upstream read failed");
                    break "read error";
                }
                None => break "stream ended",
            }
        };

        {
            let mut writer = self.writer.lock().await;
            if writer.as_ref().is_some_and(|w| w.session == session.id) {
                if let Some(mut stale) = writer.take() {
                    let _ = stale.sink.close().await;
                }
            }
        }
        self.connection_dropped(session.id, reason);
    }

    /// Common bookkeeping when a physical connection goes away. Ignored for
    /// sessions that a newer connection has already superseded.
    /// Runs at most once per session, whichever of the writer or the
    /// reader notices the loss first.
    fn connection_dropped(&self, session: u64, reason: &str) {
        if self.shutdown.is_cancelled() || self.current_session.load(Ordering::Acquire) != session {
            return;
        }
        if self.dropped_session.fetch_max(session, Ordering::AcqRel) >= session {
            return;
        }
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            tracing::warn!(parent: &self.span, session = session, reason = reason, "Upstream connection lost");
        }
        if self.config.fail_pending_on_disconnect {
            self.registry.fail_all(reason);
        }
    }

    /// Explicit shutdown: stop the loop, close the socket, fail everything
    /// still pending.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();

        {
            // Wait out a handshake in flight so it cannot install a socket
            // after teardown.
            let _attempt = self.connect_lock.lock().await;
            let writer = self.writer.lock().await.take();
            if let Some(mut writer) = writer {
                writer.dropped.cancel();
                if let Err(e) = writer.sink.close().await {
                    tracing::warn!(parent: &self.span, error = %e, "Error while closing upstream socket");
                }
            }
            self.pending_session.lock().take();
        }

        let handle = self.receive_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.registry.fail_all("gateway shutting down");
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(parent: &self.span, "Upstream connection closed");
    }
}
