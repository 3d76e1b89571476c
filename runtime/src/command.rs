//! Command side: authoritative writes followed by event publication.
//!
//! Every command first commits to the write store. Publishing the resulting
//! event is best effort: it is retried briefly and then, if the broker is
//! still failing, logged and dropped. The caller always sees the outcome of
//! the write, never of the publish. A lost event leaves the read model
//! stale, which is preferred over failing a write that already happened.
//!
//! [`ReviewAdminService`] holds the one administrative operation on the read
//! model: removing an album's review aggregate.

use crate::metrics::PublishMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use album_store_core::album::{Album, AlbumStoreError, AlbumWriteStore, NewAlbum, ValidationError};
use album_store_core::broker::EventPublisher;
use album_store_core::event::{AlbumCreated, DomainEvent, ImageUploaded};
use album_store_core::review::{RepositoryError, ReviewRepository};
use chrono::{Datelike, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned to the command caller.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The request is invalid.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The album does not exist.
    #[error("album {0} not found")]
    NotFound(String),

    /// The write store failed.
    #[error(transparent)]
    Store(#[from] AlbumStoreError),

    /// The review repository failed.
    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for CommandError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound(album_id) => Self::NotFound(album_id),
            other => Self::Repository(other),
        }
    }
}

/// Album commands.
pub struct AlbumCommandService {
    store: Arc<dyn AlbumWriteStore>,
    publisher: Arc<dyn EventPublisher>,
    publish_retry: RetryPolicy,
}

impl AlbumCommandService {
    /// Service with the default publish retry policy.
    #[must_use]
    pub fn new(store: Arc<dyn AlbumWriteStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            publish_retry: RetryPolicy::default(),
        }
    }

    /// Replace the publish retry policy.
    #[must_use]
    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }

    /// Validate and store an album, then announce it and its cover image.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Validation`] if the request is invalid
    /// - [`CommandError::Store`] if the album could not be saved
    pub async fn create_album(&self, new: NewAlbum) -> Result<Album, CommandError> {
        new.validate(Utc::now().year())?;

        let album = Album::from_new(Uuid::new_v4().to_string(), new, Utc::now());
        self.store.save_album(&album).await?;
        tracing::info!(album_id = %album.album_id, title = %album.title, "Album saved");

        self.publish(DomainEvent::album_created(AlbumCreated {
            album_id: album.album_id.clone(),
            artist: album.artist.clone(),
            title: album.title.clone(),
            year: album.year.clone(),
            image_id: album.image_id.clone(),
            image_size: album.image_size,
        }))
        .await;

        self.publish(DomainEvent::image_uploaded(ImageUploaded {
            album_id: album.album_id.clone(),
            image_id: album.image_id.clone(),
            image_size: album.image_size,
            requires_processing: true,
        }))
        .await;

        Ok(album)
    }

    /// Record a like and announce it.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`] if the album does not exist
    /// - [`CommandError::Store`] if the intent could not be saved
    pub async fn like_album(&self, album_id: &str) -> Result<(), CommandError> {
        self.review(album_id, true).await
    }

    /// Record a dislike and announce it.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`] if the album does not exist
    /// - [`CommandError::Store`] if the intent could not be saved
    pub async fn dislike_album(&self, album_id: &str) -> Result<(), CommandError> {
        self.review(album_id, false).await
    }

    async fn review(&self, album_id: &str, liked: bool) -> Result<(), CommandError> {
        match self.store.get_album(album_id).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(AlbumStoreError::NotFound(_)) => {
                return Err(CommandError::NotFound(album_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        self.store.save_review_intent(album_id, liked).await?;

        let event = if liked {
            DomainEvent::album_liked(album_id)
        } else {
            DomainEvent::album_disliked(album_id)
        };
        self.publish(event).await;
        Ok(())
    }

    async fn publish(&self, event: DomainEvent) {
        let event_type = event.event_type().as_str();
        let result = retry_with_backoff(&self.publish_retry, || self.publisher.publish(&event)).await;

        match result {
            Ok(()) => {
                PublishMetrics::record_published(event_type);
                tracing::debug!(event_id = %event.id, event_type, "Event published");
            }
            Err(e) => {
                PublishMetrics::record_failure(event_type);
                tracing::error!(
                    event_id = %event.id,
                    event_type,
                    album_id = event.payload.album_id(),
                    error = %e,
                    "Failed to publish event, read model will lag"
                );
            }
        }
    }
}

/// Administrative operations on the review read model.
pub struct ReviewAdminService {
    reviews: Arc<dyn ReviewRepository>,
}

impl ReviewAdminService {
    /// Service over `reviews`.
    #[must_use]
    pub fn new(reviews: Arc<dyn ReviewRepository>) -> Self {
        Self { reviews }
    }

    /// Remove the review aggregate of `album_id`.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotFound`] if the album has no aggregate
    /// - [`CommandError::Repository`] if the repository failed
    pub async fn delete_reviews(&self, album_id: &str) -> Result<(), CommandError> {
        self.reviews.delete(album_id).await?;
        tracing::info!(album_id, "Review aggregate deleted");
        Ok(())
    }
}
