mod config;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use drover_subscriber::{Delivery, InMemoryQueue, Subscriber};
use serde_json::json;

use crate::config::WorkerConfig;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any configuration
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "drover_worker=info,drover_subscriber=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("drover_worker=info,drover_subscriber=info".to_string());
    }
    init_telemetry(&telemetry_config);

    tracing::info!("drover-worker starting...");

    let config = WorkerConfig::from_env();
    tracing::info!(
        parallelism = config.subscriber.parallelism,
        refresh_interval_secs = config.subscriber.refresh_interval_secs,
        seed_messages = config.seed_messages,
        handler_delay_ms = config.handler_delay.as_millis() as u64,
        "Loaded worker configuration"
    );

    let queue = Arc::new(InMemoryQueue::new(config.queue.clone()));
    for n in 0..config.seed_messages {
        queue.send(json!({ "sequence": n }));
    }

    let subscriber = Subscriber::new(queue.clone(), config.subscriber.clone());

    let delay = config.handler_delay;
    subscriber.on_message(move |delivery| handle(delivery, delay));
    subscriber.on_error(|err| tracing::warn!(error = %err, "Subscriber error"));
    subscriber.on_stopped(|| tracing::info!("Polling stopped"));
    subscriber.on_drained(|| tracing::info!("All admitted messages completed"));

    subscriber
        .start()
        .context("Failed to start subscriber")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(in_flight = subscriber.len(), "Received shutdown signal");

    subscriber.graceful_shutdown().await;

    tracing::info!(
        acknowledged = queue.acknowledged_count(),
        remaining = queue.len(),
        "Worker shutdown complete"
    );
    Ok(())
}

/// Demo handler: simulate work, then acknowledge
async fn handle(delivery: Delivery, delay: std::time::Duration) -> Result<()> {
    tracing::debug!(
        message_id = %delivery.id,
        payload = %delivery.payload,
        "Processing message"
    );

    tokio::time::sleep(delay).await;
    delivery
        .ack()
        .await
        .with_context(|| format!("Failed to acknowledge message {}", delivery.id))?;

    tracing::info!(message_id = %delivery.id, "Processed message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_subscriber::SubscriberConfig;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_demo_handler_drains_seeded_queue() {
        let queue = Arc::new(InMemoryQueue::default());
        for n in 0..5 {
            queue.send(json!({ "sequence": n }));
        }

        let subscriber = Subscriber::new(queue.clone(), SubscriberConfig::new(2));
        subscriber.on_message(|delivery| handle(delivery, Duration::from_millis(50)));
        subscriber.start().unwrap();

        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscriber.graceful_shutdown().await;

        assert_eq!(queue.acknowledged_count(), 5);
        assert!(subscriber.is_stopped());
    }

    #[test]
    fn test_default_worker_config() {
        let config = WorkerConfig::default();

        assert_eq!(config.seed_messages, 100);
        assert_eq!(config.handler_delay, Duration::from_millis(250));
        assert_eq!(config.subscriber.parallelism, 10);
    }
}
