//! QueueAdapter trait definition

use async_trait::async_trait;

use crate::message::Message;

/// Error type for adapter operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Backend request failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Message is unknown to the backend
    #[error("message not found: {0}")]
    NotFound(String),

    /// The lease used for the request is no longer held
    #[error("lease expired for message: {0}")]
    LeaseExpired(String),
}

/// Capability interface consumed by the subscriber
///
/// Implementations talk to one concrete backend. Retry and back-off
/// policy for backend calls belongs here, not in the subscriber.
///
/// # Example
///
/// ```ignore
/// struct MyQueue { client: Client }
///
/// #[async_trait]
/// impl QueueAdapter for MyQueue {
///     fn max_batch_size(&self) -> usize { 10 }
///
///     async fn receive(&self, max_messages: usize) -> Result<Vec<Message>, AdapterError> {
///         self.client.receive(max_messages).await.map_err(|e| AdapterError::Backend(e.to_string()))
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Largest batch a single `receive` call may return
    fn max_batch_size(&self) -> usize;

    /// Fetch up to `max_messages` messages
    ///
    /// Messages that cannot be fully decoded must be omitted rather than
    /// returned partially.
    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>, AdapterError>;

    /// Acknowledge (delete) a message so the backend does not redeliver it
    async fn acknowledge(&self, message: &Message) -> Result<(), AdapterError>;

    /// Extend the message lease so it stays invisible for `seconds` more
    async fn extend_lease(&self, message: &Message, seconds: u64) -> Result<(), AdapterError>;

    /// Human-readable name for logging/debugging.
    fn name(&self) -> &'static str {
        "QueueAdapter"
    }
}
