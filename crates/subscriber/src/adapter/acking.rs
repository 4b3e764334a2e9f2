//! Acknowledgment decorator

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::queue::{AdapterError, QueueAdapter};
use crate::error::SubscriberError;
use crate::events::{EventListeners, SubscriberEvent};
use crate::message::Message;
use crate::signal::SignalBus;

/// Adapter decorator owned by the subscriber
///
/// Forwards every call to the wrapped backend. A successful `acknowledge`
/// additionally fires the `acknowledged` signal for the matching
/// deliveries and emits [`SubscriberEvent::Acknowledged`]. A failed one is
/// reported on the error channel and returned to the caller unchanged.
pub struct AcknowledgingAdapter {
    inner: Arc<dyn QueueAdapter>,
    signals: Arc<SignalBus>,
    events: Arc<EventListeners>,
}

impl AcknowledgingAdapter {
    /// Wrap a backend adapter
    pub fn new(
        inner: Arc<dyn QueueAdapter>,
        signals: Arc<SignalBus>,
        events: Arc<EventListeners>,
    ) -> Self {
        Self {
            inner,
            signals,
            events,
        }
    }

    /// The wrapped backend
    pub fn inner(&self) -> &Arc<dyn QueueAdapter> {
        &self.inner
    }
}

#[async_trait]
impl QueueAdapter for AcknowledgingAdapter {
    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>, AdapterError> {
        self.inner.receive(max_messages).await
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), AdapterError> {
        if let Err(e) = self.inner.acknowledge(message).await {
            self.events.emit_error(SubscriberError::Acknowledge {
                message_id: message.id.clone(),
                source: e.clone(),
            });
            return Err(e);
        }

        let deliveries = self.signals.fire_acknowledged(message);
        debug!(
            message_id = %message.id,
            deliveries = deliveries.len(),
            "Message acknowledged"
        );

        self.events.emit(SubscriberEvent::Acknowledged {
            message_id: message.id.clone(),
            lease_token: message.lease_token.clone(),
        });
        Ok(())
    }

    async fn extend_lease(&self, message: &Message, seconds: u64) -> Result<(), AdapterError> {
        self.inner.extend_lease(message, seconds).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
