//! Event handlers run by the workers.
//!
//! - [`ReviewAggregateHandler`]: `ALBUM_LIKED` / `ALBUM_DISLIKED` → atomic
//!   counter increment in the review repository
//! - [`ImageUploadedHandler`]: `IMAGE_UPLOADED` → thumbnail job, when the
//!   upload asks for processing
//! - [`AlbumCreatedHandler`]: `ALBUM_CREATED` → payload check and audit log
//!
//! [`pipeline_registry`] wires them into a [`HandlerRegistry`].

use crate::image_dispatch::ImageDispatchQueue;
use crate::registry::{EventHandler, HandlerError, HandlerRegistry};
use album_store_core::event::{EventEnvelope, EventPayload, EventType};
use album_store_core::image::ProcessImageRequest;
use album_store_core::review::ReviewRepository;
use async_trait::async_trait;
use std::sync::Arc;

/// Applies review events to the review aggregate.
pub struct ReviewAggregateHandler {
    repository: Arc<dyn ReviewRepository>,
}

impl ReviewAggregateHandler {
    /// Handler writing to `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn ReviewRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventHandler for ReviewAggregateHandler {
    fn name(&self) -> &'static str {
        "review-aggregate"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let decoded = event.decode()?;
        match &decoded.payload {
            EventPayload::AlbumLiked(review) => self.repository.add_like(&review.album_id).await?,
            EventPayload::AlbumDisliked(review) => {
                self.repository.add_dislike(&review.album_id).await?;
            }
            other => {
                return Err(HandlerError::UnexpectedEvent {
                    handler: self.name(),
                    event_type: other.event_type(),
                });
            }
        }
        tracing::debug!(
            event_id = %decoded.id,
            album_id = decoded.payload.album_id(),
            event_type = %decoded.event_type(),
            "Review aggregate updated"
        );
        Ok(())
    }
}

/// Submits thumbnail jobs for uploaded images.
pub struct ImageUploadedHandler {
    images: ImageDispatchQueue,
}

impl ImageUploadedHandler {
    /// Handler submitting to `images`.
    #[must_use]
    pub const fn new(images: ImageDispatchQueue) -> Self {
        Self { images }
    }
}

#[async_trait]
impl EventHandler for ImageUploadedHandler {
    fn name(&self) -> &'static str {
        "image-uploaded"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let decoded = event.decode()?;
        let EventPayload::ImageUploaded(upload) = &decoded.payload else {
            return Err(HandlerError::UnexpectedEvent {
                handler: self.name(),
                event_type: decoded.event_type(),
            });
        };

        if !upload.requires_processing {
            tracing::debug!(album_id = %upload.album_id, image_id = %upload.image_id, "No processing required");
            return Ok(());
        }

        let request = ProcessImageRequest::for_album_image(&upload.album_id, &upload.image_id);
        self.images.try_submit(&upload.album_id, request)?;
        tracing::info!(
            event_id = %decoded.id,
            album_id = %upload.album_id,
            image_id = %upload.image_id,
            "Image processing requested"
        );
        Ok(())
    }
}

/// Validates `ALBUM_CREATED` payloads and records them in the log.
pub struct AlbumCreatedHandler;

#[async_trait]
impl EventHandler for AlbumCreatedHandler {
    fn name(&self) -> &'static str {
        "album-created"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let decoded = event.decode()?;
        let EventPayload::AlbumCreated(album) = &decoded.payload else {
            return Err(HandlerError::UnexpectedEvent {
                handler: self.name(),
                event_type: decoded.event_type(),
            });
        };
        tracing::info!(
            event_id = %decoded.id,
            album_id = %album.album_id,
            artist = %album.artist,
            title = %album.title,
            "Album created"
        );
        Ok(())
    }
}

/// Registry with the standard handlers.
///
/// The image handler is only registered when a dispatch queue is given;
/// without it `IMAGE_UPLOADED` messages are unroutable and deleted.
#[must_use]
pub fn pipeline_registry(
    reviews: Arc<dyn ReviewRepository>,
    images: Option<ImageDispatchQueue>,
) -> HandlerRegistry {
    let review_handler: Arc<dyn EventHandler> = Arc::new(ReviewAggregateHandler::new(reviews));

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::AlbumLiked, Arc::clone(&review_handler))
        .register(EventType::AlbumDisliked, review_handler)
        .register(EventType::AlbumCreated, Arc::new(AlbumCreatedHandler));
    if let Some(images) = images {
        registry.register(EventType::ImageUploaded, Arc::new(ImageUploadedHandler::new(images)));
    }
    registry
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if setup fails
mod tests {
    use super::*;
    use album_store_core::event::{AlbumCreated, DomainEvent, ImageUploaded};
    use album_store_core::image::ImageError;
    use album_store_testing::{InMemoryReviewRepository, RecordingImageProcessor};

    fn envelope(event: &DomainEvent) -> EventEnvelope {
        EventEnvelope::from_slice(&event.to_json().expect("encode")).expect("decode")
    }

    fn upload(requires_processing: bool) -> DomainEvent {
        DomainEvent::image_uploaded(ImageUploaded {
            album_id: "A1".to_string(),
            image_id: "img".to_string(),
            image_size: 10,
            requires_processing,
        })
    }

    #[tokio::test]
    async fn review_handler_increments_matching_counter() {
        let repository = Arc::new(InMemoryReviewRepository::new());
        let handler = ReviewAggregateHandler::new(repository.clone());

        handler.handle(&envelope(&DomainEvent::album_liked("A1"))).await.expect("like");
        handler.handle(&envelope(&DomainEvent::album_liked("A1"))).await.expect("like");
        handler.handle(&envelope(&DomainEvent::album_disliked("A1"))).await.expect("dislike");

        let aggregate = repository.snapshot("A1").expect("aggregate created");
        assert_eq!(aggregate.counts(), (2, 1));
    }

    #[tokio::test]
    async fn review_handler_rejects_other_event_types() {
        let repository = Arc::new(InMemoryReviewRepository::new());
        let handler = ReviewAggregateHandler::new(repository.clone());

        let result = handler.handle(&envelope(&upload(true))).await;

        assert!(matches!(
            result,
            Err(HandlerError::UnexpectedEvent { event_type: EventType::ImageUploaded, .. })
        ));
        assert!(repository.snapshot("A1").is_none());
    }

    #[tokio::test]
    async fn review_handler_rejects_mismatched_payload() {
        let repository = Arc::new(InMemoryReviewRepository::new());
        let handler = ReviewAggregateHandler::new(repository.clone());
        let mut envelope = envelope(&DomainEvent::album_liked("A1"));
        envelope.payload = serde_json::json!({ "title": "no album id" });

        assert!(matches!(handler.handle(&envelope).await, Err(HandlerError::Decode(_))));
        assert!(repository.snapshot("A1").is_none());
    }

    #[tokio::test]
    async fn image_handler_submits_only_when_processing_required() {
        let processor = Arc::new(RecordingImageProcessor::new());
        let (queue, task) = ImageDispatchQueue::builder(processor.clone()).spawn();
        let handler = ImageUploadedHandler::new(queue);

        handler.handle(&envelope(&upload(false))).await.expect("skip");
        handler.handle(&envelope(&upload(true))).await.expect("submit");
        drop(handler);
        task.join().await;

        assert_eq!(
            processor.requests(),
            vec![ProcessImageRequest::for_album_image("A1", "img")]
        );
    }

    #[tokio::test]
    async fn image_handler_fails_when_queue_is_full() {
        let processor =
            Arc::new(RecordingImageProcessor::new().with_delay(std::time::Duration::from_secs(1)));
        let (queue, _task) = ImageDispatchQueue::builder(processor).capacity(1).spawn();
        let handler = ImageUploadedHandler::new(queue);

        let first = handler.handle(&envelope(&upload(true))).await;
        let second = handler.handle(&envelope(&upload(true))).await;

        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(HandlerError::Image(ImageError::QueueFull { capacity: 1 }))
        ));
    }

    #[tokio::test]
    async fn album_created_handler_accepts_valid_payload() {
        let event = DomainEvent::album_created(AlbumCreated {
            album_id: "A1".to_string(),
            artist: "Can".to_string(),
            title: "Tago Mago".to_string(),
            year: "1971".to_string(),
            image_id: "img".to_string(),
            image_size: 1,
        });
        assert!(AlbumCreatedHandler.handle(&envelope(&event)).await.is_ok());
    }

    #[test]
    fn pipeline_registry_routes_standard_types() {
        let registry = pipeline_registry(Arc::new(InMemoryReviewRepository::new()), None);

        assert_eq!(registry.handlers_for(EventType::AlbumLiked).len(), 1);
        assert_eq!(registry.handlers_for(EventType::AlbumDisliked).len(), 1);
        assert_eq!(registry.handlers_for(EventType::AlbumCreated).len(), 1);
        assert!(registry.handlers_for(EventType::ImageUploaded).is_empty());
    }
}
