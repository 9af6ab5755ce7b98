//! Correlation id → delivery channel map.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_core::ids::CorrelationId;
use tether_core::wire::InboundMessage;
use tether_telemetry::LogContext;
use tokio::sync::{mpsc, Mutex};
use tracing::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMode {
    Unary,
    Stream,
}

/// Outcome of one pull from a pending request's channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Message(InboundMessage),
    /// The router had to drop a frame for this request because its channel
    /// was full. Whatever is still queued is incomplete.
    Overflowed,
    /// The entry left the registry and everything queued has been read.
    Closed,
}

/// One in-flight logical request and its bounded FIFO channel.
pub struct PendingRequest {
    correlation_id: CorrelationId,
    mode: RequestMode,
    created_at: DateTime<Utc>,
    /// Taken when the entry leaves the registry, which closes the channel.
    tx: parking_lot::RwLock<Option<mpsc::Sender<InboundMessage>>>,
    rx: Mutex<mpsc::Receiver<InboundMessage>>,
    overflowed: AtomicBool,
}

impl PendingRequest {
    fn new(correlation_id: CorrelationId, mode: RequestMode, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            correlation_id,
            mode,
            created_at: Utc::now(),
            tx: parking_lot::RwLock::new(Some(tx)),
            rx: Mutex::new(rx),
            overflowed: AtomicBool::new(false),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Non-blocking push. On a full channel the message is dropped and the
    /// entry is marked overflowed; a closed entry refuses the message.
    pub(crate) fn try_deliver(
        &self,
        message: InboundMessage,
    ) -> Result<(), mpsc::error::TrySendError<InboundMessage>> {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            return Err(mpsc::error::TrySendError::Closed(message));
        };
        let result = tx.try_send(message);
        if let Err(mpsc::error::TrySendError::Full(_)) = &result {
            self.overflowed.store(true, Ordering::Release);
        }
        result
    }

    /// Stop accepting deliveries. Already queued messages stay readable,
    /// after which `recv` yields [`Delivery::Closed`].
    pub(crate) fn close(&self) {
        self.tx.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Wait for the next delivery. Cancel-safe.
    pub async fn recv(&self) -> Delivery {
        if self.is_overflowed() {
            return Delivery::Overflowed;
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(message) => Delivery::Message(message),
            None => Delivery::Closed,
        }
    }

    /// Take a queued message without waiting.
    pub fn try_recv(&self) -> Option<InboundMessage> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("mode", &self.mode)
            .field("created_at", &self.created_at)
            .field("overflowed", &self.is_overflowed())
            .finish()
    }
}

/// Registry of all pending requests. At most one entry per correlation id.
pub struct RequestRegistry {
    entries: DashMap<CorrelationId, Arc<PendingRequest>>,
    capacity: usize,
    dropped: AtomicU64,
    span: Span,
}

impl RequestRegistry {
    pub fn new(capacity: usize, log: &LogContext) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            dropped: AtomicU64::new(0),
            span: log.component("registry"),
        }
    }

    /// Create the entry for `id`, or return the existing one unchanged.
    /// Must run before the matching frame is sent.
    pub fn register(&self, id: &CorrelationId, mode: RequestMode) -> Arc<PendingRequest> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(parent: &self.span, correlation_id = %id, "Reusing existing registration");
                Arc::clone(existing.get())
            }
            Entry::Vacant(slot) => {
                let entry = Arc::new(PendingRequest::new(id.clone(), mode, self.capacity));
                slot.insert(Arc::clone(&entry));
                tracing::debug!(parent: &self.span, correlation_id = %id, mode = ?mode, "Registered request");
                entry
            }
        }
    }

    /// Register and wrap the entry in a guard that releases it on drop.
    pub fn register_guarded(self: &Arc<Self>, id: &CorrelationId, mode: RequestMode) -> RegistrationGuard {
        let entry = self.register(id, mode);
        RegistrationGuard {
            registry: Arc::clone(self),
            entry,
        }
    }

    /// Remove whatever entry is registered under `id`. No-op when absent.
    pub fn unregister(&self, id: &CorrelationId) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        entry.close();
        tracing::debug!(parent: &self.span, correlation_id = %id, "Unregistered request");
        true
    }

    /// Remove `entry` only if the map still holds that exact entry, so a
    /// late release never evicts a newer registration under the same id.
    pub fn release(&self, entry: &Arc<PendingRequest>) -> bool {
        let removed = self
            .entries
            .remove_if(entry.correlation_id(), |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            entry.close();
        }
        removed
    }

    pub fn get(&self, id: &CorrelationId) -> Option<Arc<PendingRequest>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Frames dropped because a consumer's channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Push a synthetic `ConnectionLost` message to every pending request
    /// and drain the map. Returns how many requests were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            let Some((_, entry)) = self.entries.remove(&id) else {
                continue;
            };
            // A full channel is already marked overflowed, which the
            // consumer surfaces as an error on its next pull.
            let _ = entry.try_deliver(InboundMessage::connection_lost(id, reason));
            entry.close();
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!(parent: &self.span, failed = failed, reason = reason, "Failed pending requests");
        }
        failed
    }
}

/// Scoped ownership of a registration. Dropping the guard is the single
/// cleanup path for completion, timeout, error and cancellation.
pub struct RegistrationGuard {
    registry: Arc<RequestRegistry>,
    entry: Arc<PendingRequest>,
}

impl RegistrationGuard {
    pub fn entry(&self) -> &Arc<PendingRequest> {
        &self.entry
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.entry.correlation_id()
    }

    pub async fn recv(&self) -> Delivery {
        self.entry.recv().await
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.registry.release(&self.entry) {
            let age = Utc::now() - self.entry.created_at();
            tracing::debug!(
                parent: &self.registry.span,
                correlation_id = %self.entry.correlation_id(),
                age_ms = age.num_milliseconds(),
                "Released registration"
            );
        }
    }
}
