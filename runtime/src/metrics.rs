//! Prometheus metrics for the event pipeline.
//!
//! Counters cover the whole path of a message: received, handled, dropped past
//! the retry ceiling, and the poll and delete failures in between. Publish and
//! image dispatch have their own counters.
//!
//! # Example
//!
//! ```rust,no_run
//! use album_store_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Scrape endpoint at http://0.0.0.0:9090/metrics
//! MetricsExporter::new("0.0.0.0:9090".parse()?).install()?;
//! # Ok(())
//! # }
//! ```

use crate::processor::MessageOutcome;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter with its own HTTP listener.
#[derive(Debug, Clone, Copy)]
pub struct MetricsExporter {
    addr: SocketAddr,
}

impl MetricsExporter {
    /// Exporter listening on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions and install the global recorder.
    ///
    /// Must be called from within a tokio runtime; the listener runs on it.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed or
    /// the listener cannot bind.
    pub fn install(self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "worker_messages_received_total",
        "Messages returned by receive calls"
    );
    describe_counter!(
        "worker_messages_processed_total",
        "Messages processed, labelled by outcome"
    );
    describe_counter!(
        "worker_handler_failures_total",
        "Handler invocations that returned an error"
    );
    describe_counter!(
        "worker_messages_dropped_total",
        "Messages deleted after exceeding the retry ceiling"
    );
    describe_counter!("worker_poll_errors_total", "Failed receive calls");
    describe_counter!("worker_delete_errors_total", "Failed delete calls");
    describe_histogram!(
        "worker_message_duration_seconds",
        "Time from dispatch to outcome for one message"
    );

    describe_counter!("publisher_events_published_total", "Events handed to the broker");
    describe_counter!(
        "publisher_publish_failures_total",
        "Events that could not be published after retries"
    );
    describe_counter!(
        "publisher_duplicates_suppressed_total",
        "Publishes skipped because the event id was seen recently"
    );

    describe_counter!(
        "review_repository_increments_total",
        "Review counter increments, labelled by backend and counter"
    );

    describe_counter!("image_dispatch_submitted_total", "Image jobs accepted");
    describe_counter!(
        "image_dispatch_rejected_total",
        "Image jobs rejected because the queue was full"
    );
    describe_counter!("image_dispatch_failures_total", "Image jobs that failed");

    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!("retry_exhausted_total", "Operations that ran out of retries");
}

/// Consumer-side metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a received batch.
    pub fn record_received(count: usize) {
        counter!("worker_messages_received_total").increment(count as u64);
    }

    /// Record the outcome of one message.
    pub fn record_outcome(outcome: MessageOutcome, event_type: &str, duration: Duration) {
        counter!(
            "worker_messages_processed_total",
            "outcome" => outcome.as_str(),
            "event_type" => event_type.to_string()
        )
        .increment(1);
        if outcome == MessageOutcome::Dropped {
            counter!("worker_messages_dropped_total", "event_type" => event_type.to_string())
                .increment(1);
        }
        histogram!("worker_message_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed handler invocation.
    pub fn record_handler_failure(handler: &'static str) {
        counter!("worker_handler_failures_total", "handler" => handler).increment(1);
    }

    /// Record a failed receive.
    pub fn record_poll_error() {
        counter!("worker_poll_errors_total").increment(1);
    }

    /// Record a failed delete.
    pub fn record_delete_error() {
        counter!("worker_delete_errors_total").increment(1);
    }
}

/// Publish-side metrics recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a published event.
    pub fn record_published(event_type: &'static str) {
        counter!("publisher_events_published_total", "event_type" => event_type).increment(1);
    }

    /// Record an event that was given up on.
    pub fn record_failure(event_type: &'static str) {
        counter!("publisher_publish_failures_total", "event_type" => event_type).increment(1);
    }
}

/// Image dispatch metrics recorder.
pub struct ImageDispatchMetrics;

impl ImageDispatchMetrics {
    /// Record an accepted job.
    pub fn record_submitted() {
        counter!("image_dispatch_submitted_total").increment(1);
    }

    /// Record a job rejected by a full queue.
    pub fn record_rejected() {
        counter!("image_dispatch_rejected_total").increment(1);
    }

    /// Record a failed job.
    pub fn record_failure() {
        counter!("image_dispatch_failures_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn outcome_counters_render_with_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            ConsumerMetrics::record_received(3);
            ConsumerMetrics::record_outcome(
                MessageOutcome::Dropped,
                "ALBUM_LIKED",
                Duration::from_millis(5),
            );
            ConsumerMetrics::record_handler_failure("review-aggregate");
        });

        let rendered = handle.render();
        assert!(rendered.contains("worker_messages_received_total 3"));
        assert!(rendered.contains(r#"outcome="dropped""#));
        assert!(rendered.contains("worker_messages_dropped_total"));
        assert!(rendered.contains(r#"handler="review-aggregate""#));
    }
}
