//! Queue backend adapters
//!
//! This module provides:
//! - [`QueueAdapter`] - Capability interface every backend implements
//! - [`AcknowledgingAdapter`] - Decorator that turns acks into completion signals
//! - [`InMemoryQueue`] - Backend with visibility timeouts, for tests and local runs

mod acking;
mod memory;
mod queue;

pub use acking::AcknowledgingAdapter;
pub use memory::{InMemoryQueue, InMemoryQueueConfig};
pub use queue::{AdapterError, QueueAdapter};
