//! # Album Store Runtime
//!
//! Moving parts of the event pipeline.
//!
//! ## Core Components
//!
//! - **Command service**: writes to the store, then publishes (non-fatal)
//! - **Handler registry**: event type → ordered handlers, frozen before start
//! - **Message processor**: one worker's poll → dispatch → acknowledge loop
//! - **Worker pool**: N processors on one queue with coordinated shutdown
//! - **Image dispatch**: bounded, supervised queue for thumbnail jobs
//!
//! ## Example
//!
//! ```ignore
//! use album_store_runtime::{handlers::pipeline_registry, pool::WorkerPool, processor::ProcessorConfig};
//!
//! let registry = Arc::new(pipeline_registry(reviews, Some(images)));
//! let handle = WorkerPool::new(queue, registry, ProcessorConfig::default(), 10).start();
//!
//! // ... on SIGTERM
//! let report = handle.shutdown().await;
//! ```

/// Album commands with best-effort event publication
pub mod command;

/// Standard event handlers
pub mod handlers;

/// Bounded queue for image processing jobs
pub mod image_dispatch;

/// Prometheus metrics for observability
pub mod metrics;

/// Worker pool orchestration
pub mod pool;

/// Per-worker queue consumer
pub mod processor;

/// Event type → handler mapping
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

pub use command::{AlbumCommandService, CommandError, ReviewAdminService};
pub use pool::{ShutdownReport, WorkerPool, WorkerPoolHandle};
pub use processor::{MessageOutcome, MessageProcessor, ProcessorConfig};
pub use registry::{EventHandler, HandlerError, HandlerRegistry};
