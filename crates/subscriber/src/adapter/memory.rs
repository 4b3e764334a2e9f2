//! In-memory implementation of QueueAdapter

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::queue::{AdapterError, QueueAdapter};
use crate::config::duration_millis;
use crate::message::Message;

/// Attribute carrying how many times a message has been received
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "receive_count";

/// In-memory queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InMemoryQueueConfig {
    /// Largest batch a single receive returns
    pub max_batch_size: usize,

    /// How long a received message stays invisible without a lease extension
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl InMemoryQueueConfig {
    /// Set the maximum batch size
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Lease held by a consumer
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Internal message state
struct StoredMessage {
    id: String,
    payload: serde_json::Value,
    attributes: HashMap<String, String>,
    receive_count: u32,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.expires_at <= now)
    }
}

/// In-memory queue backend
///
/// Mirrors the lease semantics of hosted queues: a received message is
/// hidden for the visibility timeout under a fresh lease token; acking or
/// extending requires that token; an expired lease makes the message
/// visible again and the next receive redelivers it.
///
/// # Example
///
/// ```
/// use drover_subscriber::InMemoryQueue;
///
/// let queue = InMemoryQueue::default();
/// queue.send(serde_json::json!({"order_id": 42}));
/// assert_eq!(queue.len(), 1);
/// ```
pub struct InMemoryQueue {
    config: InMemoryQueueConfig,
    messages: Mutex<VecDeque<StoredMessage>>,
    receive_calls: AtomicUsize,
    acknowledged: AtomicUsize,
    extensions: AtomicUsize,
}

impl InMemoryQueue {
    /// Create a new in-memory queue
    pub fn new(config: InMemoryQueueConfig) -> Self {
        Self {
            config,
            messages: Mutex::new(VecDeque::new()),
            receive_calls: AtomicUsize::new(0),
            acknowledged: AtomicUsize::new(0),
            extensions: AtomicUsize::new(0),
        }
    }

    /// Enqueue a message and return its id
    pub fn send(&self, payload: serde_json::Value) -> String {
        self.send_with_attributes(payload, HashMap::new())
    }

    /// Enqueue a message with attributes and return its id
    pub fn send_with_attributes(
        &self,
        payload: serde_json::Value,
        attributes: HashMap<String, String>,
    ) -> String {
        let id = Uuid::now_v7().to_string();
        self.messages.lock().push_back(StoredMessage {
            id: id.clone(),
            payload,
            attributes,
            receive_count: 0,
            lease: None,
        });
        id
    }

    /// Total number of messages not yet acknowledged
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether every message has been acknowledged
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Number of messages currently visible to receivers
    pub fn pending_count(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.is_visible(now))
            .count()
    }

    /// Number of messages currently leased
    pub fn in_flight_count(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| !m.is_visible(now))
            .count()
    }

    /// Number of receive calls served
    pub fn receive_count(&self) -> usize {
        self.receive_calls.load(Ordering::Relaxed)
    }

    /// Number of successful acknowledgments
    pub fn acknowledged_count(&self) -> usize {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Number of successful lease extensions
    pub fn extend_count(&self) -> usize {
        self.extensions.load(Ordering::Relaxed)
    }

    /// Find the leased message matching `message`, checking its lease
    fn leased<'a>(
        messages: &'a mut VecDeque<StoredMessage>,
        message: &Message,
        now: Instant,
    ) -> Result<(usize, &'a mut StoredMessage), AdapterError> {
        let index = messages
            .iter()
            .position(|m| m.id == message.id)
            .ok_or_else(|| AdapterError::NotFound(message.id.clone()))?;
        let stored = &mut messages[index];

        let held = stored.lease.as_ref().is_some_and(|lease| {
            Some(lease.token.as_str()) == message.lease_token.as_deref() && lease.expires_at > now
        });
        if !held {
            return Err(AdapterError::LeaseExpired(message.id.clone()));
        }
        Ok((index, stored))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(InMemoryQueueConfig::default())
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueue {
    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>, AdapterError> {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);
        let limit = max_messages.min(self.config.max_batch_size);
        let now = Instant::now();
        let expires_at = now + self.config.visibility_timeout;

        let mut messages = self.messages.lock();
        let batch: Vec<Message> = messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(limit)
            .map(|stored| {
                let token = Uuid::now_v7().to_string();
                stored.receive_count += 1;
                stored.lease = Some(Lease {
                    token: token.clone(),
                    expires_at,
                });

                let mut message = Message::new(stored.id.clone(), stored.payload.clone())
                    .with_lease_token(token)
                    .with_received_at(Utc::now());
                message.attributes = stored.attributes.clone();
                message
                    .attributes
                    .insert(RECEIVE_COUNT_ATTRIBUTE.to_string(), stored.receive_count.to_string());
                message
            })
            .collect();

        trace!(requested = max_messages, count = batch.len(), "Served receive");
        Ok(batch)
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), AdapterError> {
        let mut messages = self.messages.lock();
        let (index, _) = Self::leased(&mut messages, message, Instant::now())?;
        messages.remove(index);
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_lease(&self, message: &Message, seconds: u64) -> Result<(), AdapterError> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let (_, stored) = Self::leased(&mut messages, message, now)?;
        if let Some(lease) = stored.lease.as_mut() {
            lease.expires_at = now + Duration::from_secs(seconds);
        }
        self.extensions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemoryQueue"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility: Duration) -> InMemoryQueue {
        InMemoryQueue::new(
            InMemoryQueueConfig::default()
                .with_max_batch_size(3)
                .with_visibility_timeout(visibility),
        )
    }

    #[tokio::test]
    async fn test_receive_respects_batch_limit() {
        let queue = queue(Duration::from_secs(30));
        for i in 0..5 {
            queue.send(serde_json::json!({ "n": i }));
        }

        let batch = queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|m| m.lease_token.is_some()));
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.in_flight_count(), 3);

        let smaller = queue.receive(1).await.unwrap();
        assert_eq!(smaller.len(), 1);
        assert_eq!(queue.receive_count(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_message() {
        let queue = queue(Duration::from_secs(30));
        queue.send(serde_json::json!("hello"));

        let message = queue.receive(1).await.unwrap().remove(0);
        queue.acknowledge(&message).await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.acknowledged_count(), 1);

        let again = queue.acknowledge(&message).await;
        assert_eq!(again, Err(AdapterError::NotFound(message.id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers() {
        let queue = queue(Duration::from_secs(5));
        queue.send(serde_json::json!("hello"));

        let first = queue.receive(1).await.unwrap().remove(0);
        assert!(queue.receive(1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;

        let second = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(first.id, second.id);
        assert_ne!(first.lease_token, second.lease_token);
        assert_eq!(second.attribute(RECEIVE_COUNT_ATTRIBUTE), Some("2"));

        // The stale lease can no longer ack
        let stale = queue.acknowledge(&first).await;
        assert_eq!(stale, Err(AdapterError::LeaseExpired(first.id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lease_keeps_message_hidden() {
        let queue = queue(Duration::from_secs(5));
        queue.send(serde_json::json!("hello"));

        let message = queue.receive(1).await.unwrap().remove(0);

        tokio::time::advance(Duration::from_secs(4)).await;
        queue.extend_lease(&message, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(queue.receive(1).await.unwrap().is_empty());
        assert_eq!(queue.extend_count(), 1);
        queue.acknowledge(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_attributes_are_preserved() {
        let queue = queue(Duration::from_secs(30));
        let mut attributes = HashMap::new();
        attributes.insert("tenant".to_string(), "acme".to_string());
        let id = queue.send_with_attributes(serde_json::json!({}), attributes);

        let message = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(message.id, id);
        assert_eq!(message.attribute("tenant"), Some("acme"));
        assert_eq!(message.attribute(RECEIVE_COUNT_ATTRIBUTE), Some("1"));
    }
}
