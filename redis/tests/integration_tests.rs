//! Integration tests for the Redis backends with a real Redis instance.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker to be running (for testcontainers). To run explicitly:
//! ```bash
//! cargo test -p album-store-redis --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]

use album_store_core::broker::{EventPublisher, MessageQueue, ReceiveOptions};
use album_store_core::event::{DomainEvent, EventEnvelope, EventType};
use album_store_core::review::{RepositoryError, ReviewRepository};
use album_store_redis::{RedisReviewRepository, RedisStreamBroker};
use album_store_testing::InMemoryReviewRepository;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::{REDIS_PORT, Redis};

async fn start_redis() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");
    (container, format!("redis://{host}:{port}"))
}

async fn broker(url: &str, visibility_timeout: Duration) -> RedisStreamBroker {
    RedisStreamBroker::builder()
        .url(url)
        .stream("test-events")
        .group("test-workers")
        .visibility_timeout(visibility_timeout)
        .build()
        .await
        .expect("broker should connect")
}

fn quick() -> ReceiveOptions {
    ReceiveOptions::new(10, Duration::from_millis(100))
}

#[tokio::test]
#[ignore]
async fn published_event_is_received_with_attributes_and_acknowledged() {
    let (_container, url) = start_redis().await;
    let broker = broker(&url, Duration::from_secs(30)).await;
    let event = DomainEvent::album_liked("A1");

    broker.publish(&event).await.expect("publish");
    let batch = broker.receive(quick()).await.expect("receive");

    assert_eq!(batch.len(), 1);
    let message = &batch[0];
    assert_eq!(message.receive_count, 1);
    assert_eq!(message.event_type_attribute(), Some("ALBUM_LIKED"));
    assert_eq!(message.attributes.get("albumId").map(String::as_str), Some("A1"));
    let envelope = EventEnvelope::from_slice(&message.body).expect("envelope");
    assert_eq!(envelope.id, event.id);
    assert_eq!(envelope.known_type(), Some(EventType::AlbumLiked));

    broker.delete(&message.receipt).await.expect("delete");
    assert!(broker.receive(quick()).await.expect("receive").is_empty());
    assert!(broker.delete(&message.receipt).await.is_err());
}

#[tokio::test]
#[ignore]
async fn unacknowledged_entry_is_redelivered_with_higher_count() {
    let (_container, url) = start_redis().await;
    let broker = broker(&url, Duration::from_millis(200)).await;
    broker
        .publish(&DomainEvent::album_disliked("A1"))
        .await
        .expect("publish");

    let first = broker.receive(quick()).await.expect("receive");
    assert_eq!(first.len(), 1);
    assert!(broker.receive(quick()).await.expect("receive").is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = broker.receive(quick()).await.expect("receive");

    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_eq!(second[0].receive_count, 2);
}

#[tokio::test]
#[ignore]
async fn republishing_the_same_event_is_suppressed() {
    let (_container, url) = start_redis().await;
    let broker = broker(&url, Duration::from_secs(30)).await;
    let event = DomainEvent::album_liked("A1");

    broker.publish(&event).await.expect("publish");
    broker.publish(&event).await.expect("duplicate publish still succeeds");

    assert_eq!(broker.receive(quick()).await.expect("receive").len(), 1);
}

#[tokio::test]
#[ignore]
async fn failed_append_leaves_the_event_publishable() {
    let (_container, url) = start_redis().await;
    let broker = broker(&url, Duration::from_secs(30)).await;
    let event = DomainEvent::album_liked("A1");

    let client = redis::Client::open(url.as_str()).expect("client");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("connection");
    // A plain string under the stream key makes XADD fail with WRONGTYPE.
    let () = redis::pipe()
        .atomic()
        .cmd("DEL")
        .arg("test-events")
        .ignore()
        .cmd("SET")
        .arg("test-events")
        .arg("not a stream")
        .ignore()
        .query_async(&mut conn)
        .await
        .expect("replace stream");

    assert!(broker.publish(&event).await.is_err());

    let _: i64 = redis::cmd("DEL")
        .arg("test-events")
        .query_async(&mut conn)
        .await
        .expect("drop key");
    let broker = self::broker(&url, Duration::from_secs(30)).await;

    broker.publish(&event).await.expect("publish after failure");
    let batch = broker.receive(quick()).await.expect("receive");
    assert_eq!(batch.len(), 1);
    let envelope = EventEnvelope::from_slice(&batch[0].body).expect("envelope");
    assert_eq!(envelope.id, event.id);
}

#[tokio::test]
#[ignore]
async fn acknowledging_in_one_group_keeps_the_entry_for_other_groups() {
    let (_container, url) = start_redis().await;
    let group = |name: &'static str| {
        RedisStreamBroker::builder()
            .url(&url)
            .stream("test-events")
            .group(name)
            .build()
    };
    let reviews = group("reviews").await.expect("reviews group");
    let images = group("images").await.expect("images group");

    reviews
        .publish(&DomainEvent::album_liked("A1"))
        .await
        .expect("publish");

    let batch = reviews.receive(quick()).await.expect("receive");
    assert_eq!(batch.len(), 1);
    reviews.delete(&batch[0].receipt).await.expect("acknowledge");
    assert!(reviews.receive(quick()).await.expect("receive").is_empty());

    let other = images.receive(quick()).await.expect("receive");
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].message_id, batch[0].message_id);
}

#[tokio::test]
#[ignore]
async fn concurrent_increments_are_never_lost() {
    let (_container, url) = start_redis().await;
    let reviews = RedisReviewRepository::new(&url, "album_reviews")
        .await
        .expect("connect");

    let likes = (0..64).map(|_| reviews.add_like("A1"));
    for result in futures::future::join_all(likes).await {
        result.expect("increment");
    }

    let aggregate = reviews.get_by_album("A1").await.expect("get").expect("hash");
    assert_eq!(aggregate.counts(), (64, 0));
}

#[tokio::test]
#[ignore]
async fn matches_in_memory_backend_for_the_same_sequence() {
    let (_container, url) = start_redis().await;
    let redis = RedisReviewRepository::new(&url, "album_reviews")
        .await
        .expect("connect");
    let memory = InMemoryReviewRepository::new();
    let backends: [&dyn ReviewRepository; 2] = [&redis, &memory];

    let sequence = [("A1", true), ("A2", false), ("A1", false), ("A1", true), ("A3", true)];
    for backend in backends {
        for (album_id, liked) in sequence {
            if liked {
                backend.add_like(album_id).await.expect("like");
            } else {
                backend.add_dislike(album_id).await.expect("dislike");
            }
        }
        backend.delete("A3").await.expect("delete");
    }

    for album_id in ["A1", "A2", "A3"] {
        let from_redis = redis.get_by_album(album_id).await.expect("get").map(|a| a.counts());
        let from_memory = memory.get_by_album(album_id).await.expect("get").map(|a| a.counts());
        assert_eq!(from_redis, from_memory, "album {album_id}");
    }
    assert!(matches!(redis.delete("A3").await, Err(RepositoryError::NotFound(_))));
}
