//! Lifecycle and error notifications
//!
//! The subscriber reports everything that happens outside a handler's
//! return value through [`SubscriberEvent`]s. Callbacks are registered per
//! [`EventKind`] and invoked synchronously in registration order; a
//! panicking callback is logged and does not prevent the others from
//! running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::SubscriberError;
use crate::signal::DeliveryId;

/// Notification emitted by the subscriber
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// A receive call returned no messages
    Empty,

    /// A non-fatal error occurred
    Error(Arc<SubscriberError>),

    /// The subscriber stopped admitting new work
    Paused,

    /// The subscriber resumed admitting work
    Resumed,

    /// The polling loop exited; the subscriber cannot be started again
    Stopped,

    /// Graceful shutdown finished draining all admitted work
    Drained,

    /// A message was acknowledged through the subscriber's adapter
    Acknowledged {
        message_id: String,
        lease_token: Option<String>,
    },

    /// All handlers for a delivery settled
    Finished {
        message_id: String,
        delivery_id: DeliveryId,
    },
}

impl SubscriberEvent {
    /// The kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Empty => EventKind::Empty,
            Self::Error(_) => EventKind::Error,
            Self::Paused => EventKind::Paused,
            Self::Resumed => EventKind::Resumed,
            Self::Stopped => EventKind::Stopped,
            Self::Drained => EventKind::Drained,
            Self::Acknowledged { .. } => EventKind::Acknowledged,
            Self::Finished { .. } => EventKind::Finished,
        }
    }
}

/// Discriminant of [`SubscriberEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Empty,
    Error,
    Paused,
    Resumed,
    Stopped,
    Drained,
    Acknowledged,
    Finished,
}

impl EventKind {
    /// Stable name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Stopped => "stopped",
            Self::Drained => "drained",
            Self::Acknowledged => "acknowledged",
            Self::Finished => "finished",
        }
    }
}

/// Event callback
pub type EventCallback = Arc<dyn Fn(&SubscriberEvent) + Send + Sync>;

/// Registered event callbacks
#[derive(Default)]
pub struct EventListeners {
    listeners: RwLock<Vec<(EventKind, EventCallback)>>,
}

impl EventListeners {
    /// Create an empty listener set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one kind of event
    pub fn on(&self, kind: EventKind, callback: EventCallback) {
        self.listeners.write().push((kind, callback));
    }

    /// Number of callbacks registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Invoke every callback registered for the event's kind
    pub fn emit(&self, event: SubscriberEvent) {
        let kind = event.kind();
        // Snapshot so callbacks may register further listeners
        let callbacks: Vec<EventCallback> = self
            .listeners
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        debug!(event = kind.as_str(), listeners = callbacks.len(), "Emitting event");

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(event = kind.as_str(), "Event listener panicked");
            }
        }
    }

    /// Log and emit a non-fatal error
    pub fn emit_error(&self, err: SubscriberError) {
        error!(error = %err, "Subscriber error");
        self.emit(SubscriberEvent::Error(Arc::new(err)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(listeners: &EventListeners, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        listeners.on(
            kind,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn test_emit_routes_by_kind() {
        let listeners = EventListeners::new();
        let empty = counter(&listeners, EventKind::Empty);
        let paused = counter(&listeners, EventKind::Paused);

        listeners.emit(SubscriberEvent::Empty);
        listeners.emit(SubscriberEvent::Empty);

        assert_eq!(empty.load(Ordering::SeqCst), 2);
        assert_eq!(paused.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let listeners = EventListeners::new();
        listeners.on(EventKind::Drained, Arc::new(|_| panic!("listener bug")));
        let drained = counter(&listeners, EventKind::Drained);

        listeners.emit(SubscriberEvent::Drained);

        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_error_wraps_error() {
        let listeners = EventListeners::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = Arc::clone(&seen);
        listeners.on(
            EventKind::Error,
            Arc::new(move |event| {
                if let SubscriberEvent::Error(err) = event {
                    *s.lock() = Some(err.to_string());
                }
            }),
        );

        listeners.emit_error(SubscriberError::HandlerPanicked {
            message_id: "m-1".to_string(),
        });

        assert_eq!(
            seen.lock().as_deref(),
            Some("handler panicked while processing message m-1")
        );
    }

    #[test]
    fn test_listener_count() {
        let listeners = EventListeners::new();
        counter(&listeners, EventKind::Finished);
        counter(&listeners, EventKind::Finished);
        assert_eq!(listeners.listener_count(EventKind::Finished), 2);
        assert_eq!(listeners.listener_count(EventKind::Empty), 0);
    }
}
