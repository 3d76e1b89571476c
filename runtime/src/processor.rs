//! Queue consumer: one worker's poll/dispatch/acknowledge loop.
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────────────── empty batch ───────────────────┐
//!            ▼                                                     │
//! Idle ──► Polling ──── batch ────► Dispatching ──► Idle           │
//!   ▲        │  ▲                                                  │
//!   │        │  └──────────────────────────────────────────────────┘
//!   │     receive error
//!   │        ▼
//!   └──── Backoff (fixed delay)
//! ```
//!
//! Cancellation is checked at the top of `Polling` and while blocked in a
//! receive or a backoff sleep. Once a batch has been received it is always
//! dispatched to completion, so no message is left half handled.
//!
//! # Acknowledgement
//!
//! | Situation                          | Action           | Outcome        |
//! |------------------------------------|------------------|----------------|
//! | body is not an event envelope      | log error, delete| `Malformed`    |
//! | no handler for the type            | warn, delete     | `Unroutable`   |
//! | every handler succeeded            | delete           | `Acknowledged` |
//! | a handler failed, count ≤ ceiling  | keep             | `Retrying`     |
//! | a handler failed, count > ceiling  | log error, delete| `Dropped`      |
//!
//! The type comes from the `EventType` attribute when present, otherwise from
//! the body. The chosen type is written into the envelope before handlers run,
//! so routing and payload decoding always agree.
//!
//! The retry ceiling is where a broker dead-letter policy attaches: a
//! message is never deleted for failing before its delivery count exceeds it.

use crate::metrics::ConsumerMetrics;
use crate::registry::HandlerRegistry;
use album_store_core::broker::{BrokerError, MessageQueue, QueueMessage, ReceiveOptions};
use album_store_core::event::EventEnvelope;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Tunables for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Long-poll parameters.
    pub receive: ReceiveOptions,
    /// Deliveries after which a failing message is dropped.
    pub retry_ceiling: u32,
    /// Delay after a failed receive.
    pub poll_error_backoff: Duration,
    /// Messages of one batch processed at the same time.
    pub max_in_flight: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            receive: ReceiveOptions::default(),
            retry_ceiling: 3,
            poll_error_backoff: Duration::from_secs(5),
            max_in_flight: 10,
        }
    }
}

impl ProcessorConfig {
    /// Set the batch limit (clamped to `1..=10`).
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.receive = ReceiveOptions::new(max_messages, self.receive.wait_time);
        self
    }

    /// Set the long-poll wait.
    #[must_use]
    pub const fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.receive.wait_time = wait_time;
        self
    }

    /// Set the retry ceiling.
    #[must_use]
    pub const fn with_retry_ceiling(mut self, retry_ceiling: u32) -> Self {
        self.retry_ceiling = retry_ceiling;
        self
    }

    /// Set the delay after a failed receive.
    #[must_use]
    pub const fn with_poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    /// Set the per-batch concurrency limit (at least 1).
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOutcome {
    /// All handlers succeeded; deleted.
    Acknowledged,
    /// Body could not be parsed; deleted.
    Malformed,
    /// No handler registered for the type; deleted.
    Unroutable,
    /// A handler failed; left for redelivery.
    Retrying,
    /// A handler failed past the retry ceiling; deleted.
    Dropped,
}

impl MessageOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Malformed => "malformed",
            Self::Unroutable => "unroutable",
            Self::Retrying => "retrying",
            Self::Dropped => "dropped",
        }
    }

    /// Whether the message is deleted.
    #[must_use]
    pub const fn deletes(self) -> bool {
        !matches!(self, Self::Retrying)
    }
}

enum WorkerState {
    Idle,
    Polling,
    Dispatching(Vec<QueueMessage>),
    Backoff,
}

/// One consumer loop over a shared queue and registry.
pub struct MessageProcessor {
    worker_id: usize,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
}

impl MessageProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        worker_id: usize,
        queue: Arc<dyn MessageQueue>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            worker_id,
            queue,
            registry,
            config,
        }
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.worker_id, "Worker started");
        let mut state = WorkerState::Idle;

        loop {
            state = match state {
                WorkerState::Idle => WorkerState::Polling,
                WorkerState::Polling => {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            WorkerState::Polling
                        }
                        result = self.queue.receive(self.config.receive) => match result {
                            Ok(batch) if batch.is_empty() => WorkerState::Polling,
                            Ok(batch) => WorkerState::Dispatching(batch),
                            Err(e) => {
                                ConsumerMetrics::record_poll_error();
                                tracing::error!(
                                    worker = self.worker_id,
                                    error = %e,
                                    backoff_secs = self.config.poll_error_backoff.as_secs(),
                                    "Receive failed, backing off"
                                );
                                WorkerState::Backoff
                            }
                        },
                    }
                }
                WorkerState::Dispatching(batch) => {
                    self.dispatch_batch(batch).await;
                    WorkerState::Idle
                }
                WorkerState::Backoff => {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            WorkerState::Backoff
                        }
                        () = tokio::time::sleep(self.config.poll_error_backoff) => WorkerState::Idle,
                    }
                }
            };
        }

        tracing::info!(worker = self.worker_id, "Worker stopped");
    }

    /// Receive one batch and dispatch it. Used by tests and one-shot drains.
    ///
    /// # Errors
    ///
    /// Returns the receive error without backing off.
    pub async fn poll_once(&self) -> Result<Vec<MessageOutcome>, BrokerError> {
        let batch = self.queue.receive(self.config.receive).await?;
        Ok(self.dispatch_batch(batch).await)
    }

    /// Process a batch with at most `max_in_flight` messages at a time.
    pub async fn dispatch_batch(&self, batch: Vec<QueueMessage>) -> Vec<MessageOutcome> {
        ConsumerMetrics::record_received(batch.len());
        tracing::debug!(worker = self.worker_id, size = batch.len(), "Dispatching batch");

        futures::stream::iter(batch)
            .map(|message| self.process_message(message))
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await
    }

    /// Decode, route, run handlers and acknowledge one message.
    pub async fn process_message(&self, message: QueueMessage) -> MessageOutcome {
        let started = Instant::now();

        let mut envelope = match EventEnvelope::from_slice(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    worker = self.worker_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Malformed message body, deleting"
                );
                return self.finish(&message, "unknown", MessageOutcome::Malformed, started).await;
            }
        };

        // Handlers decode by the envelope's type, so it must match the route.
        if let Some(routed) = message
            .event_type_attribute()
            .filter(|routed| *routed != envelope.event_type)
        {
            envelope.event_type = routed.to_string();
        }
        let event_type = envelope.event_type.clone();
        let handlers = self.registry.handlers_for_name(&event_type);

        if handlers.is_empty() {
            tracing::warn!(
                worker = self.worker_id,
                message_id = %message.message_id,
                event_id = %envelope.id,
                event_type = %event_type,
                "No handler registered for event type, deleting"
            );
            return self.finish(&message, &event_type, MessageOutcome::Unroutable, started).await;
        }

        let mut failures = 0usize;
        for handler in handlers {
            if let Err(e) = handler.handle(&envelope).await {
                failures += 1;
                ConsumerMetrics::record_handler_failure(handler.name());
                tracing::warn!(
                    worker = self.worker_id,
                    message_id = %message.message_id,
                    event_id = %envelope.id,
                    event_type = %event_type,
                    handler = handler.name(),
                    receive_count = message.receive_count,
                    error = %e,
                    "Handler failed"
                );
            }
        }

        let outcome = if failures == 0 {
            MessageOutcome::Acknowledged
        } else if message.receive_count > self.config.retry_ceiling {
            tracing::error!(
                worker = self.worker_id,
                message_id = %message.message_id,
                event_id = %envelope.id,
                event_type = %event_type,
                receive_count = message.receive_count,
                retry_ceiling = self.config.retry_ceiling,
                failures,
                "Retry ceiling exceeded, dropping message"
            );
            MessageOutcome::Dropped
        } else {
            MessageOutcome::Retrying
        };

        self.finish(&message, &event_type, outcome, started).await
    }

    async fn finish(
        &self,
        message: &QueueMessage,
        event_type: &str,
        outcome: MessageOutcome,
        started: Instant,
    ) -> MessageOutcome {
        if outcome.deletes() {
            if let Err(e) = self.queue.delete(&message.receipt).await {
                ConsumerMetrics::record_delete_error();
                tracing::warn!(
                    worker = self.worker_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Delete failed, message will be redelivered"
                );
            }
        }
        ConsumerMetrics::record_outcome(outcome, event_type, started.elapsed());
        outcome
    }
}
