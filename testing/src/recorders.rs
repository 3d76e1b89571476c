//! Recorders for the outbound edges: event publication and image processing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use album_store_core::broker::{BrokerError, EventPublisher};
use album_store_core::event::DomainEvent;
use album_store_core::image::{ImageError, ImageProcessor, ProcessImageRequest};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// [`EventPublisher`] that keeps every successfully published event.
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<DomainEvent>>>,
    attempts: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingPublisher {
    /// Publisher that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher that always fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Publisher whose first `count` attempts fail.
    #[must_use]
    pub fn failing_first(count: usize) -> Self {
        let publisher = Self::default();
        publisher.failures_left.store(count, Ordering::SeqCst);
        publisher
    }

    /// Events published so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Publish attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(BrokerError::PublishFailed {
                    topic: "recording".to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        })
    }
}

/// [`ImageProcessor`] that records every submitted request.
#[derive(Clone, Debug, Default)]
pub struct RecordingImageProcessor {
    requests: Arc<Mutex<Vec<ProcessImageRequest>>>,
    delay: Duration,
    fail: bool,
}

impl RecordingImageProcessor {
    /// Processor that accepts every request immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every submission.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject every request after recording it.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Requests submitted so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ProcessImageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ImageProcessor for RecordingImageProcessor {
    fn submit(
        &self,
        request: ProcessImageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), ImageError>> + Send + '_>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let source_key = request.source_key.clone();
            self.requests.lock().unwrap().push(request);
            if self.fail {
                return Err(ImageError::ProcessingFailed {
                    source_key,
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(())
        })
    }
}
