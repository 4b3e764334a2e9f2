//! Lease refresh for in-flight deliveries
//!
//! Each admitted delivery gets a repeating timer that extends its lease
//! until the delivery finishes or is acknowledged. Timers are tracked in a
//! table keyed by [`DeliveryId`] and cancelled by lookup-and-remove, so
//! the set of live timers can be inspected at any time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::adapter::QueueAdapter;
use crate::error::SubscriberError;
use crate::events::EventListeners;
use crate::message::Message;
use crate::signal::{DeliveryId, DeliverySignals};

/// Share of the lease interval after which the lease is renewed, in percent
pub const REFRESH_SAFETY_PERCENT: u64 = 70;

/// Tick period for a lease interval, or `None` when refresh is disabled
pub fn refresh_period(interval_secs: u64) -> Option<Duration> {
    if interval_secs == 0 {
        return None;
    }
    let millis = interval_secs
        .saturating_mul(1000)
        .saturating_mul(REFRESH_SAFETY_PERCENT)
        / 100;
    Some(Duration::from_millis(millis))
}

/// Why a refresher stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Finished,
    Acknowledged,
    Cancelled,
}

/// Per-delivery lease refresh timers
pub struct LeaseRefresher {
    interval_secs: u64,
    adapter: Arc<dyn QueueAdapter>,
    events: Arc<EventListeners>,
    timers: Arc<DashMap<DeliveryId, CancellationToken>>,
}

impl LeaseRefresher {
    /// Create a refresher requesting `interval_secs` per extension (0 disables)
    pub fn new(
        interval_secs: u64,
        adapter: Arc<dyn QueueAdapter>,
        events: Arc<EventListeners>,
    ) -> Self {
        Self {
            interval_secs,
            adapter,
            events,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Whether refresh timers are created at all
    pub fn is_enabled(&self) -> bool {
        self.interval_secs > 0
    }

    /// Time between two extensions of the same lease
    pub fn tick_period(&self) -> Option<Duration> {
        refresh_period(self.interval_secs)
    }

    /// Start refreshing the lease of one delivery
    ///
    /// Returns `false` without creating a timer when refresh is disabled.
    /// The timer stops on whichever of `finished` or `acknowledged` fires
    /// first, or on [`cancel`](Self::cancel). An extension still in flight
    /// when one of those fires is abandoned.
    pub fn start(&self, message: Arc<Message>, signals: DeliverySignals) -> bool {
        let Some(period) = self.tick_period() else {
            return false;
        };

        let id = signals.id();
        let cancel = CancellationToken::new();
        // Registered before spawning so the task's own removal cannot race ahead
        self.timers.insert(id, cancel.clone());

        let adapter = Arc::clone(&self.adapter);
        let events = Arc::clone(&self.events);
        let timers = Arc::clone(&self.timers);
        let seconds = self.interval_secs;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let reason = loop {
                tokio::select! {
                    biased;
                    _ = signals.finished() => break StopReason::Finished,
                    _ = signals.acknowledged() => break StopReason::Acknowledged,
                    _ = cancel.cancelled() => break StopReason::Cancelled,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    biased;
                    _ = signals.finished() => break StopReason::Finished,
                    _ = signals.acknowledged() => break StopReason::Acknowledged,
                    _ = cancel.cancelled() => break StopReason::Cancelled,
                    result = adapter.extend_lease(&message, seconds) => match result {
                        Ok(()) => trace!(message_id = %message.id, delivery_id = %id, seconds, "Lease extended"),
                        Err(e) => {
                            warn!(message_id = %message.id, delivery_id = %id, error = %e, "Lease extension failed");
                            events.emit_error(SubscriberError::LeaseExtension {
                                message_id: message.id.clone(),
                                source: e,
                            });
                        }
                    }
                }
            };

            timers.remove(&id);
            debug!(message_id = %message.id, delivery_id = %id, ?reason, "Lease refresher stopped");
        });

        true
    }

    /// Cancel the timer of one delivery
    pub fn cancel(&self, id: DeliveryId) -> bool {
        match self.timers.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live timer; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<DeliveryId> = self.timers.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Number of live timers
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Whether a delivery currently has a live timer
    pub fn is_active(&self, id: DeliveryId) -> bool {
        self.timers.contains_key(&id)
    }
}
