//! Redis backends for the album store.
//!
//! - [`RedisStreamBroker`]: the topic/queue pair on Redis Streams, implementing
//!   both [`EventPublisher`](album_store_core::broker::EventPublisher) and
//!   [`MessageQueue`](album_store_core::broker::MessageQueue)
//! - [`RedisReviewRepository`]: review counters as Redis hashes
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** through a consumer group:
//! - An entry stays pending until a worker acknowledges it
//! - Entries idle longer than the visibility timeout are claimed again, with
//!   their delivery counter incremented
//! - Handlers MUST tolerate duplicates
//!
//! Requires Redis 6.2 or newer (`XAUTOCLAIM`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod reviews;

pub use broker::{BODY_FIELD, RedisStreamBroker, RedisStreamBrokerBuilder};
pub use reviews::RedisReviewRepository;
