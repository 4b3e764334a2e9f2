// Logging setup for the worker process
//
// Console logging through tracing-subscriber, filtered by RUST_LOG or LOG_LEVEL.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, logged once at startup
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "drover_subscriber=debug")
    pub log_filter: Option<String>,
    /// Whether to include the event target in console output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "drover-worker".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "drover-worker")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "drover-worker".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
        }
    }

    /// Filter to install, falling back to `info` for a missing or invalid filter
    pub fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: &TelemetryConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let config = TelemetryConfig {
            log_filter: Some("drover=verbose".to_string()),
            ..Default::default()
        };

        assert_eq!(config.filter().to_string(), "info");
    }

    #[test]
    fn test_custom_filter_is_kept() {
        let config = TelemetryConfig {
            log_filter: Some("drover_subscriber=debug".to_string()),
            ..Default::default()
        };

        assert_eq!(config.filter().to_string(), "drover_subscriber=debug");
    }
}
