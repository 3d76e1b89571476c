//! Handler registry: event type → ordered list of handlers.
//!
//! The registry is filled once at startup and then frozen behind an `Arc`
//! before any worker starts. There is no mutation through a shared reference,
//! so workers read it without locking.
//!
//! Several handlers may be bound to one type. All of them run for a matching
//! message, in registration order, and a failure in one does not skip the
//! others. The message is acknowledged only if every handler succeeded.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register(EventType::AlbumLiked, review_handler.clone())
//!     .register(EventType::AlbumDisliked, review_handler)
//!     .register_fn(EventType::AlbumCreated, "audit", |event| async move {
//!         tracing::info!(event_id = %event.id, "album created");
//!         Ok(())
//!     });
//! let registry = Arc::new(registry);
//! ```

use album_store_core::event::{EventEnvelope, EventError, EventType};
use album_store_core::image::ImageError;
use album_store_core::review::RepositoryError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors a handler can report.
///
/// Every variant is treated as retryable: the message is left for
/// redelivery until it passes the retry ceiling.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload could not be decoded for the declared type.
    #[error(transparent)]
    Decode(#[from] EventError),

    /// The review repository failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Image work could not be submitted.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// The handler was given an event type it does not process.
    #[error("Handler {handler} cannot process {event_type} events")]
    UnexpectedEvent {
        /// Handler name.
        handler: &'static str,
        /// Type it received.
        event_type: EventType,
    },

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Processes one kind of event.
///
/// Handlers receive the envelope rather than a decoded event so that a
/// payload which does not match its type surfaces as a handler error
/// instead of a crash in the dispatcher. The envelope's `event_type` is the
/// type the message was routed by.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short stable name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// Any error leaves the message unacknowledged.
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap `f` under `name`.
    pub const fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Ordered mapping from event type to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event_type`.
    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> &mut Self {
        tracing::debug!(%event_type, handler = handler.name(), "Registered event handler");
        self.handlers.entry(event_type).or_default().push(handler);
        self
    }

    /// Append an async closure as a handler for `event_type`.
    pub fn register_fn<F, Fut>(&mut self, event_type: EventType, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler::new(name, f)))
    }

    /// Handlers for a known type, in registration order.
    #[must_use]
    pub fn handlers_for(&self, event_type: EventType) -> &[Arc<dyn EventHandler>] {
        self.handlers.get(&event_type).map_or(&[], Vec::as_slice)
    }

    /// Handlers for a wire type name. Unknown names have no handlers.
    #[must_use]
    pub fn handlers_for_name(&self, name: &str) -> &[Arc<dyn EventHandler>] {
        EventType::parse(name).map_or(&[], |t| self.handlers_for(t))
    }

    /// Types with at least one handler.
    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.handlers.keys().copied()
    }

    /// `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (event_type, handlers) in &self.handlers {
            let names: Vec<_> = handlers.iter().map(|h| h.name()).collect();
            map.entry(event_type, &names);
        }
        map.finish()
    }
}
