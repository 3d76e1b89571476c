//! In-memory storage fakes.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use album_store_core::album::{Album, AlbumStoreError, AlbumWriteStore};
use album_store_core::review::{
    RepositoryError, Result as RepositoryResult, ReviewAggregate, ReviewKind, ReviewRepository,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// HashMap-backed [`ReviewRepository`].
///
/// Increments happen under a write lock, so concurrent updates never lose a
/// count. Failures can be scripted with [`fail_next`](Self::fail_next).
#[derive(Clone, Debug, Default)]
pub struct InMemoryReviewRepository {
    aggregates: Arc<RwLock<HashMap<String, ReviewAggregate>>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryReviewRepository {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current aggregate of an album, read synchronously.
    #[must_use]
    pub fn snapshot(&self, album_id: &str) -> Option<ReviewAggregate> {
        self.aggregates.read().unwrap().get(album_id).cloned()
    }

    /// Number of albums with an aggregate.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregates.read().unwrap().len()
    }

    /// `true` if no album has been reviewed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregates.read().unwrap().is_empty()
    }

    /// Make the next `count` increments or deletes fail with a storage error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ReviewRepository for InMemoryReviewRepository {
    fn get_by_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RepositoryResult<Option<ReviewAggregate>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.snapshot(album_id)) })
    }

    fn increment<'a>(
        &'a self,
        album_id: &'a str,
        kind: ReviewKind,
    ) -> Pin<Box<dyn Future<Output = RepositoryResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.injected_failure() {
                return Err(RepositoryError::Storage("injected failure".to_string()));
            }

            let now = Utc::now();
            let mut aggregates = self.aggregates.write().unwrap();
            let aggregate = aggregates.entry(album_id.to_string()).or_insert_with(|| {
                let mut fresh = ReviewAggregate::new(album_id, 0, 0);
                fresh.created_at = Some(now);
                fresh
            });
            match kind {
                ReviewKind::Like => aggregate.like_count += 1,
                ReviewKind::Dislike => aggregate.dislike_count += 1,
            }
            aggregate.updated_at = Some(now);
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RepositoryResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.injected_failure() {
                return Err(RepositoryError::Storage("injected failure".to_string()));
            }
            self.aggregates
                .write()
                .unwrap()
                .remove(album_id)
                .map(|_| ())
                .ok_or_else(|| RepositoryError::NotFound(album_id.to_string()))
        })
    }
}

/// HashMap-backed [`AlbumWriteStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryAlbumStore {
    albums: Arc<RwLock<HashMap<String, Album>>>,
    intents: Arc<RwLock<HashMap<String, Vec<bool>>>>,
}

impl InMemoryAlbumStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A valid album with the given id.
    #[must_use]
    pub fn sample_album(album_id: &str) -> Album {
        Album {
            album_id: album_id.to_string(),
            artist: "Alice Coltrane".to_string(),
            title: "Journey in Satchidananda".to_string(),
            year: "1971".to_string(),
            image_id: format!("{album_id}-cover"),
            image_size: 2048,
            thumbnail_key: None,
            created_at: Utc::now(),
        }
    }

    /// Insert an album directly, bypassing the command service.
    pub fn insert_album(&self, album: Album) {
        self.albums
            .write()
            .unwrap()
            .insert(album.album_id.clone(), album);
    }

    /// Album by id.
    #[must_use]
    pub fn album(&self, album_id: &str) -> Option<Album> {
        self.albums.read().unwrap().get(album_id).cloned()
    }

    /// Number of stored albums.
    #[must_use]
    pub fn album_count(&self) -> usize {
        self.albums.read().unwrap().len()
    }

    /// Review intents of an album in write order, `true` for likes.
    #[must_use]
    pub fn review_intents(&self, album_id: &str) -> Vec<bool> {
        self.intents
            .read()
            .unwrap()
            .get(album_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl AlbumWriteStore for InMemoryAlbumStore {
    fn save_album<'a>(
        &'a self,
        album: &'a Album,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.insert_album(album.clone());
            Ok(())
        })
    }

    fn get_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Album>, AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.album(album_id)) })
    }

    fn save_review_intent<'a>(
        &'a self,
        album_id: &'a str,
        liked: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.intents
                .write()
                .unwrap()
                .entry(album_id.to_string())
                .or_default()
                .push(liked);
            Ok(())
        })
    }

    fn set_thumbnail_key<'a>(
        &'a self,
        album_id: &'a str,
        thumbnail_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut albums = self.albums.write().unwrap();
            let album = albums
                .get_mut(album_id)
                .ok_or_else(|| AlbumStoreError::NotFound(album_id.to_string()))?;
            album.thumbnail_key = Some(thumbnail_key.to_string());
            Ok(())
        })
    }
}
