//! Review aggregate: the like/dislike counters of one album on the read side.
//!
//! The aggregate is created lazily by the first increment and removed only by
//! an explicit [`ReviewRepository::delete`]. Increments are atomic and
//! commutative, which is what lets workers apply review events in any order
//! and from any number of tasks without coordinating with each other.
//!
//! Two backends implement the same contract with different concurrency
//! strategies (a row lock in `PostgreSQL`, a native atomic counter in Redis).
//! For the same sequence of operations both report the same counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Error type for review repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No aggregate exists for the album.
    #[error("No reviews found for album {0}")]
    NotFound(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored data could not be interpreted
    #[error("Corrupt review data for album {album_id}: {reason}")]
    Corrupt {
        /// Album whose data is corrupt.
        album_id: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Like and dislike counters for one album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAggregate {
    /// Album identifier, the sole identity of the aggregate.
    pub album_id: String,
    /// Number of likes.
    pub like_count: u64,
    /// Number of dislikes.
    pub dislike_count: u64,
    /// First increment time, if the backend records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last increment time, if the backend records it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReviewAggregate {
    /// An aggregate with the given counts and no audit timestamps.
    #[must_use]
    pub fn new(album_id: impl Into<String>, like_count: u64, dislike_count: u64) -> Self {
        Self {
            album_id: album_id.into(),
            like_count,
            dislike_count,
            created_at: None,
            updated_at: None,
        }
    }

    /// The counts as a `(likes, dislikes)` pair, ignoring timestamps.
    #[must_use]
    pub const fn counts(&self) -> (u64, u64) {
        (self.like_count, self.dislike_count)
    }
}

/// Which counter an increment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewKind {
    /// `like_count`
    Like,
    /// `dislike_count`
    Dislike,
}

impl ReviewKind {
    /// Storage column / field name of the counter.
    #[must_use]
    pub const fn counter_field(self) -> &'static str {
        match self {
            Self::Like => "like_count",
            Self::Dislike => "dislike_count",
        }
    }

    /// The kind matching a review's `liked` flag.
    #[must_use]
    pub const fn from_liked(liked: bool) -> Self {
        if liked { Self::Like } else { Self::Dislike }
    }
}

/// Storage for review aggregates.
///
/// Implementations must make [`add_like`](Self::add_like) and
/// [`add_dislike`](Self::add_dislike) atomic: K concurrent calls for the same
/// album increase the counter by exactly K.
pub trait ReviewRepository: Send + Sync {
    /// Fetch the aggregate for an album, `None` if it was never reviewed.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the backend fails.
    fn get_by_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReviewAggregate>>> + Send + 'a>>;

    /// Atomically add one to the chosen counter, creating the aggregate if absent.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the backend fails. Nothing is
    /// written in that case.
    fn increment<'a>(
        &'a self,
        album_id: &'a str,
        kind: ReviewKind,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove both counters of an album.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the album has no aggregate.
    fn delete<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Atomically add one like.
    ///
    /// # Errors
    ///
    /// See [`increment`](Self::increment).
    fn add_like<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.increment(album_id, ReviewKind::Like)
    }

    /// Atomically add one dislike.
    ///
    /// # Errors
    ///
    /// See [`increment`](Self::increment).
    fn add_dislike<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.increment(album_id, ReviewKind::Dislike)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_counter_field() {
        assert_eq!(ReviewKind::from_liked(true), ReviewKind::Like);
        assert_eq!(ReviewKind::from_liked(false), ReviewKind::Dislike);
        assert_eq!(ReviewKind::Like.counter_field(), "like_count");
        assert_eq!(ReviewKind::Dislike.counter_field(), "dislike_count");
    }

    #[test]
    fn aggregate_serializes_without_audit_fields_when_absent() {
        let aggregate = ReviewAggregate::new("A1", 3, 1);
        let value = serde_json::to_value(&aggregate).unwrap_or_default();

        assert_eq!(value["albumId"], "A1");
        assert_eq!(value["likeCount"], 3);
        assert_eq!(value["dislikeCount"], 1);
        assert!(value.get("createdAt").is_none());
        assert_eq!(aggregate.counts(), (3, 1));
    }
}
