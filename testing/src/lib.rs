//! # Album Store Testing
//!
//! In-memory stand-ins for every external system the pipeline talks to.
//!
//! This crate provides:
//! - [`InMemoryQueue`]: a visibility-timeout queue with receive counts and
//!   long polling, also usable as the publish-side topic
//! - [`InMemoryReviewRepository`] and [`InMemoryAlbumStore`]: storage fakes
//! - [`RecordingPublisher`] and [`RecordingImageProcessor`]: call recorders
//!   with scripted failures
//!
//! ## Example
//!
//! ```ignore
//! use album_store_testing::{InMemoryQueue, InMemoryReviewRepository};
//!
//! let queue = Arc::new(InMemoryQueue::new());
//! queue.publish_event(&DomainEvent::album_liked("A1"))?;
//!
//! let reviews = Arc::new(InMemoryReviewRepository::new());
//! let registry = Arc::new(pipeline_registry(reviews.clone(), None));
//! MessageProcessor::new(0, queue, registry, ProcessorConfig::default()).poll_once().await?;
//!
//! assert_eq!(reviews.snapshot("A1").map(|r| r.like_count), Some(1));
//! ```

mod queue;
mod recorders;
mod stores;

pub use queue::InMemoryQueue;
pub use recorders::{RecordingImageProcessor, RecordingPublisher};
pub use stores::{InMemoryAlbumStore, InMemoryReviewRepository};

/// Test helpers
pub mod helpers {
    /// Install a `fmt` subscriber honouring `RUST_LOG`, once per process.
    ///
    /// Safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
