//! Typed event fan-out for subscription notifications.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

/// Events delivered to subscription listeners.
///
/// Notification payloads are untyped FHIR Bundles (`serde_json::Value`).
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// The server acknowledged the subscription (handshake received).
    Connect { subscription_id: String },
    /// The subscription was removed and will receive no further events.
    Disconnect { subscription_id: String },
    /// An event-notification Bundle for this subscription's criteria.
    Message(Value),
    /// A transport or protocol error. Informational; the connection
    /// recovers on its own.
    Error(String),
    /// The WebSocket connection opened (master emitter only).
    Open,
    /// The WebSocket connection closed (master emitter only).
    Close,
    /// A heartbeat Bundle from the server (master emitter only).
    Heartbeat(Value),
}

impl SubscriptionEvent {
    /// The discriminant used for listener matching.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect { .. } => EventKind::Connect,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Open => EventKind::Open,
            Self::Close => EventKind::Close,
            Self::Heartbeat(_) => EventKind::Heartbeat,
        }
    }
}

/// Event categories a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Error,
    Open,
    Close,
    Heartbeat,
}

/// Handle returned by [`SubscriptionEmitter::add_listener`], used to
/// unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&SubscriptionEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    callback: Callback,
}

/// Listener registry for one subscription criteria (or the manager-wide
/// master emitter).
///
/// Listeners fire in registration order. A panic in one listener is caught
/// and logged so the remaining listeners still run. Removing a listener
/// during dispatch is safe: dispatch iterates over a snapshot, so the
/// removal takes effect from the next event.
#[derive(Default)]
pub struct SubscriptionEmitter {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Listener>>,
}

impl SubscriptionEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    pub fn add_listener(
        &self,
        kind: EventKind,
        callback: impl Fn(&SubscriptionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener {
            id,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    /// Unregister a callback. Unknown ids are a no-op.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|l| l.id != id);
    }

    /// Number of registered listeners, across all event kinds.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invoke every listener registered for this event's kind.
    pub fn dispatch(&self, event: &SubscriptionEvent) {
        let snapshot: Vec<Callback> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind == event.kind())
            .map(|l| l.callback.clone())
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(kind = ?event.kind(), "subscription listener panicked");
            }
        }
    }
}
