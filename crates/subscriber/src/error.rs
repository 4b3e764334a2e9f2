//! Subscriber error types

use crate::adapter::AdapterError;

/// Errors raised or reported by the subscriber
///
/// `MissingHandler`, `Stopped` and `AlreadyRunning` are returned from
/// [`Subscriber::start`](crate::Subscriber::start). Every other variant is
/// non-fatal and delivered through the error notification channel.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    /// `start` was called before any message handler was registered
    #[error("message handler must be registered before start")]
    MissingHandler,

    /// `start` was called after the subscriber reached its stopped state
    #[error("subscriber is stopped and cannot be started again")]
    Stopped,

    /// `start` was called while the polling loop is already running
    #[error("subscriber is already running")]
    AlreadyRunning,

    /// A `receive` call against the queue backend failed
    #[error("failed to receive messages: {0}")]
    Receive(#[source] AdapterError),

    /// Acknowledging a message failed
    #[error("failed to acknowledge message {message_id}: {source}")]
    Acknowledge {
        message_id: String,
        #[source]
        source: AdapterError,
    },

    /// A lease extension failed; the refresher keeps ticking
    #[error("failed to extend lease for message {message_id}: {source}")]
    LeaseExtension {
        message_id: String,
        #[source]
        source: AdapterError,
    },

    /// A message handler returned an error
    #[error("handler failed for message {message_id}: {error:#}")]
    Handler {
        message_id: String,
        error: anyhow::Error,
    },

    /// A message handler panicked
    #[error("handler panicked while processing message {message_id}")]
    HandlerPanicked { message_id: String },
}

impl SubscriberError {
    /// Whether this error is returned from `start` rather than reported
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingHandler | Self::Stopped | Self::AlreadyRunning
        )
    }

    /// Id of the message this error relates to, if any
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Acknowledge { message_id, .. }
            | Self::LeaseExtension { message_id, .. }
            | Self::Handler { message_id, .. }
            | Self::HandlerPanicked { message_id } => Some(message_id),
            _ => None,
        }
    }
}
