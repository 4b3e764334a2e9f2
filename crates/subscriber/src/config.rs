//! Subscriber configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum number of concurrent handler executions
pub const DEFAULT_PARALLELISM: usize = 10;

/// Default lease refresh interval in seconds
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Default delay used when the loop has nothing to do
pub const DEFAULT_POLL_IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Maximum concurrent handler executions
    pub parallelism: usize,

    /// Lease length requested on every refresh (0 disables lease refresh)
    pub refresh_interval_secs: u64,

    /// Idle wait between polling rounds when no capacity is free
    #[serde(with = "duration_millis")]
    pub poll_idle_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            poll_idle_backoff: DEFAULT_POLL_IDLE_BACKOFF,
        }
    }
}

impl SubscriberConfig {
    /// Create a configuration with the given parallelism
    pub fn new(parallelism: usize) -> Self {
        Self::default().with_parallelism(parallelism)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SUBSCRIBER_PARALLELISM`: concurrent handlers (default: 10)
    /// - `SUBSCRIBER_REFRESH_INTERVAL_SECS`: lease refresh interval, 0 disables (default: 30)
    /// - `SUBSCRIBER_POLL_IDLE_BACKOFF_MS`: idle wait in milliseconds (default: 10)
    pub fn from_env() -> Self {
        let parallelism = std::env::var("SUBSCRIBER_PARALLELISM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PARALLELISM);

        let refresh_interval_secs = std::env::var("SUBSCRIBER_REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);

        let poll_idle_backoff = std::env::var("SUBSCRIBER_POLL_IDLE_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_IDLE_BACKOFF);

        Self {
            parallelism,
            refresh_interval_secs,
            poll_idle_backoff,
        }
        .with_parallelism(parallelism)
    }

    /// Set maximum concurrency
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the lease refresh interval (0 disables refresh)
    pub fn with_refresh_interval_secs(mut self, secs: u64) -> Self {
        self.refresh_interval_secs = secs;
        self
    }

    /// Set the idle back-off between polling rounds
    pub fn with_poll_idle_backoff(mut self, backoff: Duration) -> Self {
        self.poll_idle_backoff = backoff;
        self
    }

    /// Whether leases are refreshed while handlers run
    pub fn refresh_enabled(&self) -> bool {
        self.refresh_interval_secs > 0
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
