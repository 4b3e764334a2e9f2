//! # Drover Subscriber
//!
//! A backend-agnostic queue consumption engine.
//!
//! ## Features
//!
//! - **Capacity-driven polling**: Requests exactly as many messages as there is room for, split into backend-sized batches
//! - **Bounded execution**: A worker pool runs at most `parallelism` deliveries at once
//! - **Lease refresh**: Leases of in-flight messages are extended at 70% of the refresh interval
//! - **Completion signals**: `finished` and `acknowledged` are tracked per delivery, never leaked
//! - **Graceful shutdown**: Stop polling, drain admitted work, then report `drained`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Subscriber                            │
//! │  (polling loop, lifecycle, event listeners)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   AcknowledgingAdapter                       │
//! │  (wraps the backend, turns acks into completion signals)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueAdapter                            │
//! │  (receive, acknowledge, extend_lease on a real backend)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use drover_subscriber::prelude::*;
//!
//! let queue = Arc::new(InMemoryQueue::default());
//! queue.send(json!({ "order_id": 42 }));
//!
//! let subscriber = Subscriber::new(queue, SubscriberConfig::new(10));
//! subscriber.on_message(|delivery| async move {
//!     ship(&delivery.payload).await?;
//!     delivery.ack().await?;
//!     Ok(())
//! });
//!
//! subscriber.start()?;
//! tokio::signal::ctrl_c().await?;
//! subscriber.graceful_shutdown().await;
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod signal;
pub mod subscriber;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapter::{
        AcknowledgingAdapter, AdapterError, InMemoryQueue, InMemoryQueueConfig, QueueAdapter,
    };
    pub use crate::config::SubscriberConfig;
    pub use crate::error::SubscriberError;
    pub use crate::events::{EventKind, SubscriberEvent};
    pub use crate::message::{Delivery, Message};
    pub use crate::subscriber::Subscriber;
}

// Re-export key types at crate root
pub use adapter::{
    AcknowledgingAdapter, AdapterError, InMemoryQueue, InMemoryQueueConfig, QueueAdapter,
};
pub use config::SubscriberConfig;
pub use error::SubscriberError;
pub use events::{EventCallback, EventKind, EventListeners, SubscriberEvent};
pub use message::{Delivery, Message};
pub use signal::{DeliveryId, DeliverySignals, SignalBus};
pub use subscriber::{MessageHandler, Subscriber};
pub use worker::{
    in_flight_ceiling, refresh_period, AdmissionPlanner, LeaseRefresher, WorkerPool,
    WorkerPoolError,
};
