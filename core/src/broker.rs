//! Broker contracts: the publish side (topic) and the consume side (queue).
//!
//! ```text
//! ┌──────────────┐   publish    ┌────────┐  fan-out  ┌─────────┐  receive  ┌────────┐
//! │   Command    │─────────────►│ Topic  │──────────►│  Queue  │──────────►│ Worker │
//! │   service    │  (non-fatal) └────────┘           └─────────┘◄──────────┘        │
//! └──────────────┘                                         ▲     delete   └────────┘
//!                                                          │   (receipt)
//!                                                  redelivery after
//!                                                 visibility timeout
//! ```
//!
//! The two halves are separate traits because they are used by different
//! processes: the command side only publishes and workers only consume.
//! Delivery is at-least-once. A message that is received but not deleted
//! becomes visible again and its receive count goes up.
//!
//! Both traits return boxed futures so they stay dyn-compatible and can be
//! shared as `Arc<dyn EventPublisher>` / `Arc<dyn MessageQueue>`.

use crate::event::{DomainEvent, EventError};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Routing attribute holding the event type wire name.
pub const EVENT_TYPE_ATTRIBUTE: &str = "EventType";

/// Largest batch a single receive call may return.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Errors raised by broker clients.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Failed to connect to broker: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message.
    #[error("Failed to publish to {topic}: {reason}")]
    PublishFailed {
        /// Topic the message was sent to.
        topic: String,
        /// Underlying failure.
        reason: String,
    },

    /// A receive call failed.
    #[error("Failed to receive from {queue}: {reason}")]
    ReceiveFailed {
        /// Queue polled.
        queue: String,
        /// Underlying failure.
        reason: String,
    },

    /// A delete (acknowledge) call failed.
    #[error("Failed to delete message {receipt}: {reason}")]
    DeleteFailed {
        /// Receipt token used.
        receipt: String,
        /// Underlying failure.
        reason: String,
    },

    /// The event could not be encoded for the wire.
    #[error("Failed to encode event: {0}")]
    Encoding(#[from] EventError),
}

/// An encoded event ready to be handed to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// JSON body.
    pub body: Vec<u8>,
    /// Routing attributes, including [`EVENT_TYPE_ATTRIBUTE`].
    pub attributes: BTreeMap<String, String>,
    /// Grouping key.
    pub group_id: String,
    /// Deduplication key for brokers that support it.
    pub deduplication_id: String,
}

impl OutboundMessage {
    /// Encode an event. The event id becomes both the group and dedup key.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Encoding`] if the event cannot be serialized.
    pub fn from_event(event: &DomainEvent) -> Result<Self, BrokerError> {
        let body = event.to_json()?;
        let mut attributes = event.metadata.clone();
        attributes.insert(
            EVENT_TYPE_ATTRIBUTE.to_string(),
            event.event_type().as_str().to_string(),
        );
        Ok(Self {
            body,
            attributes,
            group_id: event.id.clone(),
            deduplication_id: event.id.clone(),
        })
    }
}

/// Publish side of the broker.
pub trait EventPublisher: Send + Sync {
    /// Publish one event to the topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejects the message
    /// and [`BrokerError::Encoding`] if the event cannot be serialized.
    fn publish<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;
}

/// Opaque token identifying one delivery of a message.
///
/// Only valid for deleting that delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Wrap a broker-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker message id, stable across redeliveries.
    pub message_id: String,
    /// Opaque body, normally a serialized event.
    pub body: Vec<u8>,
    /// Token for deleting this delivery.
    pub receipt: ReceiptHandle,
    /// Approximate number of times this message has been delivered, starting at 1.
    pub receive_count: u32,
    /// Routing attributes.
    pub attributes: BTreeMap<String, String>,
}

impl QueueMessage {
    /// The `EventType` routing attribute, if present.
    #[must_use]
    pub fn event_type_attribute(&self) -> Option<&str> {
        self.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str)
    }
}

/// Parameters of one long-poll receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Batch limit, at most [`MAX_RECEIVE_BATCH`].
    pub max_messages: usize,
    /// How long to block when the queue is empty.
    pub wait_time: Duration,
}

impl ReceiveOptions {
    /// Build options, clamping the batch limit into `1..=MAX_RECEIVE_BATCH`.
    #[must_use]
    pub fn new(max_messages: usize, wait_time: Duration) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_RECEIVE_BATCH),
            wait_time,
        }
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::new(MAX_RECEIVE_BATCH, Duration::from_secs(20))
    }
}

/// Consume side of the broker.
pub trait MessageQueue: Send + Sync {
    /// Long-poll for up to `options.max_messages` messages.
    ///
    /// Returns an empty batch when nothing arrived within the wait time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ReceiveFailed`] on broker or connection failure.
    fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueMessage>, BrokerError>> + Send + '_>>;

    /// Delete (acknowledge) a delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeleteFailed`] if the broker rejects the receipt.
    fn delete<'a>(
        &'a self,
        receipt: &'a ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
mod tests {
    use super::*;

    #[test]
    fn outbound_message_carries_type_attribute_and_keys() {
        let event = DomainEvent::album_liked("A1");
        let message = OutboundMessage::from_event(&event).expect("encoding should succeed");

        assert_eq!(
            message.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str),
            Some("ALBUM_LIKED")
        );
        assert_eq!(message.attributes.get("albumId").map(String::as_str), Some("A1"));
        assert_eq!(message.group_id, event.id);
        assert_eq!(message.deduplication_id, event.id);
    }

    #[test]
    fn receive_options_clamp_batch_size() {
        assert_eq!(ReceiveOptions::new(0, Duration::ZERO).max_messages, 1);
        assert_eq!(ReceiveOptions::new(25, Duration::ZERO).max_messages, MAX_RECEIVE_BATCH);
        assert_eq!(ReceiveOptions::new(4, Duration::ZERO).max_messages, 4);
    }

    #[test]
    fn brokers_are_dyn_compatible() {
        fn assert_object_safe(_: Option<&dyn EventPublisher>, _: Option<&dyn MessageQueue>) {}
        assert_object_safe(None, None);
    }
}
