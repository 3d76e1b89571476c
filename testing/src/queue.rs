//! In-memory queue with broker-like delivery semantics.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use album_store_core::broker::{
    BrokerError, EVENT_TYPE_ATTRIBUTE, EventPublisher, MessageQueue, OutboundMessage,
    QueueMessage, ReceiptHandle, ReceiveOptions,
};
use album_store_core::event::DomainEvent;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Stored {
    message_id: String,
    body: Vec<u8>,
    attributes: BTreeMap<String, String>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl Stored {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<Stored>,
    next_receipt: u64,
}

/// Queue with a visibility timeout, receive counts and long polling.
///
/// A received message is hidden for the visibility timeout. If it is not
/// deleted by then it becomes receivable again with a higher receive count
/// and a fresh receipt; the old receipt stops working. Receipts are single
/// use.
///
/// Also implements [`EventPublisher`], so it can stand in for a topic with
/// exactly one subscribed queue.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    arrivals: Notify,
    visibility_timeout: Duration,
    failing_receives: AtomicUsize,
    failing_deletes: AtomicUsize,
    receive_calls: AtomicUsize,
}

impl InMemoryQueue {
    /// Queue with a 30 second visibility timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    /// Queue with a custom visibility timeout.
    #[must_use]
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            visibility_timeout,
            failing_receives: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            receive_calls: AtomicUsize::new(0),
        }
    }

    /// Enqueue a raw body with the given attributes.
    pub fn push_raw(&self, body: Vec<u8>, attributes: BTreeMap<String, String>) {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.state.lock().unwrap().messages.push(Stored {
            message_id,
            body,
            attributes,
            receive_count: 0,
            invisible_until: None,
            receipt: None,
        });
        self.arrivals.notify_waiters();
    }

    /// Encode and enqueue an event the way a topic subscription would.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Encoding`] if the event cannot be serialized.
    pub fn publish_event(&self, event: &DomainEvent) -> Result<(), BrokerError> {
        let outbound = OutboundMessage::from_event(event)?;
        self.push_raw(outbound.body, outbound.attributes);
        Ok(())
    }

    /// Set an attribute on every message currently in the queue.
    pub fn override_attribute(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        for message in &mut state.messages {
            message.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Remove the routing attribute from every message currently in the queue.
    pub fn strip_event_type_attribute(&self) {
        let mut state = self.state.lock().unwrap();
        for message in &mut state.messages {
            message.attributes.remove(EVENT_TYPE_ATTRIBUTE);
        }
    }

    /// Make the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` delete calls fail. The message stays in flight
    /// and is redelivered once its visibility timeout expires.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Messages not yet deleted, visible or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// `true` once every message has been deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages received but neither deleted nor timed out.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| !m.is_visible(now))
            .count()
    }

    /// Number of receive calls made so far, failed ones included.
    #[must_use]
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Hand out up to `max` visible messages, or the instant the next hidden
    /// one reappears if none are visible.
    fn take_visible(&self, max: usize) -> Result<Vec<QueueMessage>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let State {
            messages,
            next_receipt,
        } = &mut *state;

        let mut batch = Vec::new();
        for message in messages.iter_mut().filter(|m| m.is_visible(now)).take(max) {
            *next_receipt += 1;
            let receipt = format!("{}#{}", message.message_id, next_receipt);
            message.receive_count += 1;
            message.invisible_until = Some(now + self.visibility_timeout);
            message.receipt = Some(receipt.clone());
            batch.push(QueueMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                receipt: ReceiptHandle::new(receipt),
                receive_count: message.receive_count,
                attributes: message.attributes.clone(),
            });
        }

        if batch.is_empty() {
            Err(messages.iter().filter_map(|m| m.invisible_until).min())
        } else {
            Ok(batch)
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue for InMemoryQueue {
    fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueMessage>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.receive_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_receives
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BrokerError::ReceiveFailed {
                    queue: "in-memory".to_string(),
                    reason: "injected failure".to_string(),
                });
            }

            let deadline = Instant::now() + options.wait_time;
            loop {
                let arrival = self.arrivals.notified();
                let wake_at = match self.take_visible(options.max_messages) {
                    Ok(batch) => return Ok(batch),
                    Err(reappears) => reappears.map_or(deadline, |at| at.min(deadline)),
                };
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
                tokio::select! {
                    () = arrival => {}
                    () = tokio::time::sleep_until(wake_at) => {}
                }
            }
        })
    }

    fn delete<'a>(
        &'a self,
        receipt: &'a ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let failing = self
                .failing_deletes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BrokerError::DeleteFailed {
                    receipt: receipt.to_string(),
                    reason: "injected failure".to_string(),
                });
            }

            let mut state = self.state.lock().unwrap();
            let position = state
                .messages
                .iter()
                .position(|m| m.receipt.as_deref() == Some(receipt.as_str()));
            match position {
                Some(index) => {
                    state.messages.remove(index);
                    Ok(())
                }
                None => Err(BrokerError::DeleteFailed {
                    receipt: receipt.to_string(),
                    reason: "unknown or stale receipt".to_string(),
                }),
            }
        })
    }
}

impl EventPublisher for InMemoryQueue {
    fn publish<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move { self.publish_event(event) })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if the queue misbehaves
mod tests {
    use super::*;

    fn options(wait: Duration) -> ReceiveOptions {
        ReceiveOptions::new(10, wait)
    }

    #[tokio::test]
    async fn received_message_is_hidden_until_timeout() {
        let queue = InMemoryQueue::with_visibility_timeout(Duration::from_millis(30));
        queue.push_raw(b"x".to_vec(), BTreeMap::new());

        let first = queue.receive(options(Duration::ZERO)).await.expect("receive");
        let hidden = queue.receive(options(Duration::ZERO)).await.expect("receive");
        assert_eq!(first.len(), 1);
        assert!(hidden.is_empty());
        assert_eq!(queue.in_flight(), 1);

        let again = queue
            .receive(options(Duration::from_millis(500)))
            .await
            .expect("receive");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_eq!(again[0].message_id, first[0].message_id);
    }

    #[tokio::test]
    async fn stale_receipt_cannot_delete() {
        let queue = InMemoryQueue::with_visibility_timeout(Duration::from_millis(10));
        queue.push_raw(b"x".to_vec(), BTreeMap::new());

        let first = queue.receive(options(Duration::ZERO)).await.expect("receive");
        let second = queue
            .receive(options(Duration::from_millis(500)))
            .await
            .expect("receive");

        assert!(queue.delete(&first[0].receipt).await.is_err());
        assert!(queue.delete(&second[0].receipt).await.is_ok());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_arrival() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let receiver = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(options(Duration::from_secs(5))).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_raw(b"late".to_vec(), BTreeMap::new());

        let batch = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receive should wake before its wait time")
            .expect("task should not panic")
            .expect("receive");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn batch_respects_max_messages() {
        let queue = InMemoryQueue::new();
        for _ in 0..5 {
            queue.push_raw(b"x".to_vec(), BTreeMap::new());
        }

        let batch = queue
            .receive(ReceiveOptions::new(3, Duration::ZERO))
            .await
            .expect("receive");

        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 5);
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let queue = InMemoryQueue::new();
        queue.fail_next_receives(1);

        assert!(queue.receive(options(Duration::ZERO)).await.is_err());
        assert!(queue.receive(options(Duration::ZERO)).await.is_ok());
        assert_eq!(queue.receive_calls(), 2);
    }

    #[tokio::test]
    async fn failed_delete_leaves_message_for_redelivery() {
        let queue = InMemoryQueue::with_visibility_timeout(Duration::from_millis(10));
        queue.push_raw(b"x".to_vec(), BTreeMap::new());
        queue.fail_next_deletes(1);

        let first = queue.receive(options(Duration::ZERO)).await.expect("receive");
        assert!(queue.delete(&first[0].receipt).await.is_err());
        assert_eq!(queue.len(), 1);

        let second = queue
            .receive(options(Duration::from_millis(500)))
            .await
            .expect("receive");
        assert_eq!(second[0].receive_count, 2);
        assert!(queue.delete(&second[0].receipt).await.is_ok());
        assert!(queue.is_empty());
    }
}
