//! Messages and deliveries

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, QueueAdapter};
use crate::signal::DeliveryId;

/// One unit of work dequeued from a backend
///
/// Adapters build messages fully formed; the engine never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Backend message id
    pub id: String,

    /// Backend handle for ack/extend, when the backend distinguishes it from the id
    pub lease_token: Option<String>,

    /// Opaque message body
    pub payload: serde_json::Value,

    /// Backend attributes
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// When the message was received from the backend
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Create a message received now
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            lease_token: None,
            payload,
            attributes: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Set the lease token
    pub fn with_lease_token(mut self, token: impl Into<String>) -> Self {
        self.lease_token = Some(token.into());
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the receive timestamp
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Handle used against the backend: the lease token if present, otherwise the id
    pub fn receipt(&self) -> &str {
        self.lease_token.as_deref().unwrap_or(&self.id)
    }

    /// Look up an attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A message admitted by the subscriber, as seen by message handlers
///
/// Carries the operations that mutate the message's backend state. Both go
/// through the subscriber's acknowledging adapter, so `ack` also stops the
/// lease refresher for this delivery.
#[derive(Clone)]
pub struct Delivery {
    id: DeliveryId,
    message: Arc<Message>,
    adapter: Arc<dyn QueueAdapter>,
}

impl Delivery {
    pub(crate) fn new(id: DeliveryId, message: Arc<Message>, adapter: Arc<dyn QueueAdapter>) -> Self {
        Self {
            id,
            message,
            adapter,
        }
    }

    /// Per-admission id used for completion signals
    pub fn delivery_id(&self) -> DeliveryId {
        self.id
    }

    /// The underlying message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledge (delete) the message
    pub async fn ack(&self) -> Result<(), AdapterError> {
        self.adapter.acknowledge(&self.message).await
    }

    /// Extend the message lease by `seconds`
    pub async fn extend_lease(&self, seconds: u64) -> Result<(), AdapterError> {
        self.adapter.extend_lease(&self.message, seconds).await
    }
}

impl Deref for Delivery {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("message_id", &self.message.id)
            .field("lease_token", &self.message.lease_token)
            .finish()
    }
}
