// Worker process configuration

use std::time::Duration;

use drover_subscriber::{InMemoryQueueConfig, SubscriberConfig};

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Subscriber settings
    pub subscriber: SubscriberConfig,
    /// In-memory queue settings
    pub queue: InMemoryQueueConfig,
    /// Messages enqueued at startup
    pub seed_messages: usize,
    /// Simulated work per message
    pub handler_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            subscriber: SubscriberConfig::default(),
            queue: InMemoryQueueConfig::default(),
            seed_messages: 100,
            handler_delay: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Subscriber settings come from [`SubscriberConfig::from_env`]. Worker settings:
    /// - `WORKER_SEED_MESSAGES`: messages enqueued at startup (default: 100)
    /// - `WORKER_HANDLER_DELAY_MS`: simulated work per message (default: 250)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let seed_messages = std::env::var("WORKER_SEED_MESSAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.seed_messages);

        let handler_delay = std::env::var("WORKER_HANDLER_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.handler_delay);

        Self {
            subscriber: SubscriberConfig::from_env(),
            seed_messages,
            handler_delay,
            ..defaults
        }
    }
}
