//! Completion signals for in-flight deliveries
//!
//! Every admitted message gets a [`DeliveryId`] and two one-shot signals:
//!
//! - `finished`: all handlers for the delivery have settled (success, error or panic)
//! - `acknowledged`: the message was acked through the subscriber's adapter
//!
//! The worker pool, the lease refresher and the acknowledging adapter
//! coordinate only through these signals. Each fires at most once. The
//! entry for a delivery is removed when `finished` fires, so the table
//! holds exactly the deliveries still being processed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Per-admission identifier for a message instance
///
/// Backends may hand out the same message twice (redelivery), so signals
/// are keyed by admission rather than by backend id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(u64);

impl DeliveryId {
    /// Raw sequence number
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery-{}", self.0)
    }
}

struct SignalEntry {
    message_id: String,
    lease_token: Option<String>,
    finished: CancellationToken,
    acknowledged: CancellationToken,
}

/// Listener side of one delivery's signals
#[derive(Debug, Clone)]
pub struct DeliverySignals {
    id: DeliveryId,
    finished: CancellationToken,
    acknowledged: CancellationToken,
}

impl DeliverySignals {
    /// The delivery these signals belong to
    pub fn id(&self) -> DeliveryId {
        self.id
    }

    /// Whether `finished` has fired
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Whether `acknowledged` has fired
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.is_cancelled()
    }

    /// Wait until all handlers for the delivery have settled
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Wait until the message is acknowledged
    pub async fn acknowledged(&self) {
        self.acknowledged.cancelled().await
    }
}

/// Keyed one-shot signal table
pub struct SignalBus {
    next_id: AtomicU64,
    entries: DashMap<DeliveryId, SignalEntry>,
}

impl SignalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Register a newly admitted message and return its signals
    pub fn register(&self, message: &Message) -> DeliverySignals {
        let id = DeliveryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let finished = CancellationToken::new();
        let acknowledged = CancellationToken::new();

        self.entries.insert(
            id,
            SignalEntry {
                message_id: message.id.clone(),
                lease_token: message.lease_token.clone(),
                finished: finished.clone(),
                acknowledged: acknowledged.clone(),
            },
        );

        DeliverySignals {
            id,
            finished,
            acknowledged,
        }
    }

    /// Signals for a delivery that has not finished yet
    pub fn signals(&self, id: DeliveryId) -> Option<DeliverySignals> {
        self.entries.get(&id).map(|entry| DeliverySignals {
            id,
            finished: entry.finished.clone(),
            acknowledged: entry.acknowledged.clone(),
        })
    }

    /// Fire `finished` for a delivery
    ///
    /// Returns `true` only for the call that actually fired the signal.
    pub fn fire_finished(&self, id: DeliveryId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.finished.cancel();
                true
            }
            None => false,
        }
    }

    /// Fire `acknowledged` for every live delivery of `message`
    ///
    /// A delivery matches when both its message id and lease token equal
    /// the acknowledged message's. Returns the deliveries whose signal
    /// fired on this call.
    pub fn fire_acknowledged(&self, message: &Message) -> Vec<DeliveryId> {
        let mut fired = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.message_id != message.id || entry.lease_token != message.lease_token {
                continue;
            }
            if !entry.acknowledged.is_cancelled() {
                entry.acknowledged.cancel();
                fired.push(*entry.key());
            }
        }
        fired
    }

    /// Drop every entry without firing; used by hard stop
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of deliveries that have not finished
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no delivery is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(id: &str, token: Option<&str>) -> Message {
        let message = Message::new(id, serde_json::json!({}));
        match token {
            Some(token) => message.with_lease_token(token),
            None => message,
        }
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let bus = SignalBus::new();
        let first = bus.register(&message("1", None));
        let second = bus.register(&message("1", None));

        assert_ne!(first.id(), second.id());
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_finished_fires_once_and_releases_entry() {
        let bus = SignalBus::new();
        let signals = bus.register(&message("1", None));

        assert!(bus.fire_finished(signals.id()));
        assert!(signals.is_finished());
        assert!(!bus.fire_finished(signals.id()));
        assert!(bus.is_empty());
        assert!(bus.signals(signals.id()).is_none());
    }

    #[test]
    fn test_acknowledged_matches_id_and_token() {
        let bus = SignalBus::new();
        let leased = bus.register(&message("1", Some("r-1")));
        let redelivered = bus.register(&message("1", Some("r-2")));

        let fired = bus.fire_acknowledged(&message("1", Some("r-1")));

        assert_eq!(fired, vec![leased.id()]);
        assert!(leased.is_acknowledged());
        assert!(!redelivered.is_acknowledged());
    }

    #[test]
    fn test_acknowledged_fires_once_per_delivery() {
        let bus = SignalBus::new();
        let signals = bus.register(&message("1", None));

        assert_eq!(bus.fire_acknowledged(&message("1", None)).len(), 1);
        assert!(bus.fire_acknowledged(&message("1", None)).is_empty());
        // Acknowledged deliveries stay registered until they finish
        assert!(bus.signals(signals.id()).is_some());
    }

    #[test]
    fn test_clear_drops_entries() {
        let bus = SignalBus::new();
        bus.register(&message("1", None));
        bus.register(&message("2", None));

        assert_eq!(bus.clear(), 2);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_fire() {
        let bus = std::sync::Arc::new(SignalBus::new());
        let signals = bus.register(&message("1", None));

        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.finished().await })
        };

        tokio::task::yield_now().await;
        bus.fire_finished(signals.id());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
