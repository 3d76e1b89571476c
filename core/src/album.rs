//! Write-side album model.
//!
//! The relational write store is the source of truth. It holds albums and one
//! row per like/dislike request (the review intent); the read-side counters
//! are derived from the events published after those writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Longest accepted artist name, in characters.
pub const MAX_ARTIST_LENGTH: usize = 100;

/// Longest accepted title, in characters.
pub const MAX_TITLE_LENGTH: usize = 100;

/// Largest accepted cover image (10 MiB).
pub const MAX_IMAGE_SIZE: i64 = 10 * 1024 * 1024;

/// Earliest accepted release year.
pub const MIN_YEAR: i32 = 1900;

/// Accepted cover image content types.
pub const ALLOWED_CONTENT_TYPES: [&str; 4] = ["image/jpeg", "image/jpg", "image/png", "image/gif"];

/// Rejected album input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is empty.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A field exceeds its maximum length.
    #[error("{field} exceeds maximum length of {max} characters")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Limit.
        max: usize,
    },

    /// The year is not four digits.
    #[error("year must be a 4-digit number")]
    YearFormat,

    /// The year is outside the accepted range.
    #[error("year must be between {min} and {max}")]
    YearRange {
        /// Lower bound.
        min: i32,
        /// Upper bound.
        max: i32,
    },

    /// The image size is zero, negative or too large.
    #[error("image size must be between 1 and {MAX_IMAGE_SIZE} bytes, got {0}")]
    ImageSize(i64),

    /// The image content type is not supported.
    #[error("unsupported image format: {0}. Supported formats: JPEG, PNG, GIF")]
    ContentType(String),
}

/// Errors from the write store.
#[derive(Error, Debug)]
pub enum AlbumStoreError {
    /// The album does not exist.
    #[error("Album {0} not found")]
    NotFound(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Request to create an album whose cover image is already stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlbum {
    /// Artist name.
    pub artist: String,
    /// Album title.
    pub title: String,
    /// Release year, four digits.
    pub year: String,
    /// Identifier of the stored cover image.
    pub image_id: String,
    /// Cover image size in bytes.
    pub image_size: i64,
    /// MIME type of the cover image.
    pub content_type: String,
}

impl NewAlbum {
    /// Check every field, reporting the first problem found.
    ///
    /// `current_year` bounds the release year from above (`current_year + 1`).
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered, checking artist,
    /// title, year, image size and content type in that order.
    pub fn validate(&self, current_year: i32) -> Result<(), ValidationError> {
        validate_text("artist", &self.artist, MAX_ARTIST_LENGTH)?;
        validate_text("title", &self.title, MAX_TITLE_LENGTH)?;
        validate_year(&self.year, current_year)?;

        if self.image_size <= 0 || self.image_size > MAX_IMAGE_SIZE {
            return Err(ValidationError::ImageSize(self.image_size));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&self.content_type.as_str()) {
            return Err(ValidationError::ContentType(self.content_type.clone()));
        }
        Ok(())
    }
}

fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn validate_year(year: &str, current_year: i32) -> Result<(), ValidationError> {
    if year.is_empty() {
        return Err(ValidationError::Missing("year"));
    }
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::YearFormat);
    }
    let value: i32 = year.parse().map_err(|_| ValidationError::YearFormat)?;
    let max = current_year + 1;
    if !(MIN_YEAR..=max).contains(&value) {
        return Err(ValidationError::YearRange { min: MIN_YEAR, max });
    }
    Ok(())
}

/// A stored album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    /// Album identifier.
    pub album_id: String,
    /// Artist name.
    pub artist: String,
    /// Album title.
    pub title: String,
    /// Release year.
    pub year: String,
    /// Identifier of the stored cover image.
    pub image_id: String,
    /// Cover image size in bytes.
    pub image_size: i64,
    /// Blob key of the thumbnail, once processing has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_key: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Album {
    /// Build an album from a validated request.
    #[must_use]
    pub fn from_new(album_id: String, new: NewAlbum, created_at: DateTime<Utc>) -> Self {
        Self {
            album_id,
            artist: new.artist,
            title: new.title,
            year: new.year,
            image_id: new.image_id,
            image_size: new.image_size,
            thumbnail_key: None,
            created_at,
        }
    }
}

/// Authoritative write store for albums and review intents.
pub trait AlbumWriteStore: Send + Sync {
    /// Insert a new album.
    ///
    /// # Errors
    ///
    /// Returns [`AlbumStoreError::Storage`] if the insert fails.
    fn save_album<'a>(
        &'a self,
        album: &'a Album,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>>;

    /// Fetch an album by id.
    ///
    /// # Errors
    ///
    /// Returns [`AlbumStoreError::Storage`] if the query fails.
    fn get_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Album>, AlbumStoreError>> + Send + 'a>>;

    /// Durably record one like (`liked == true`) or dislike request.
    ///
    /// # Errors
    ///
    /// Returns [`AlbumStoreError::Storage`] if the insert fails.
    fn save_review_intent<'a>(
        &'a self,
        album_id: &'a str,
        liked: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>>;

    /// Record the thumbnail key after image processing completed.
    ///
    /// # Errors
    ///
    /// Returns [`AlbumStoreError::NotFound`] if the album does not exist.
    fn set_thumbnail_key<'a>(
        &'a self,
        album_id: &'a str,
        thumbnail_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> NewAlbum {
        NewAlbum {
            artist: "Nina Simone".to_string(),
            title: "Pastel Blues".to_string(),
            year: "1965".to_string(),
            image_id: "img-1".to_string(),
            image_size: 1024,
            content_type: "image/png".to_string(),
        }
    }

    #[test]
    fn accepts_valid_album() {
        assert_eq!(valid().validate(2024), Ok(()));
    }

    #[test]
    fn rejects_missing_and_oversized_text() {
        let mut album = valid();
        album.artist.clear();
        assert_eq!(album.validate(2024), Err(ValidationError::Missing("artist")));

        let mut album = valid();
        album.title = "x".repeat(MAX_TITLE_LENGTH + 1);
        assert_eq!(
            album.validate(2024),
            Err(ValidationError::TooLong { field: "title", max: MAX_TITLE_LENGTH })
        );

        let mut album = valid();
        album.title = "é".repeat(MAX_TITLE_LENGTH);
        assert_eq!(album.validate(2024), Ok(()));
    }

    #[test]
    fn year_must_be_four_digits_in_range() {
        let check = |year: &str| {
            let mut album = valid();
            album.year = year.to_string();
            album.validate(2024)
        };

        assert_eq!(check(""), Err(ValidationError::Missing("year")));
        assert_eq!(check("65"), Err(ValidationError::YearFormat));
        assert_eq!(check("19a5"), Err(ValidationError::YearFormat));
        assert_eq!(check("1899"), Err(ValidationError::YearRange { min: 1900, max: 2025 }));
        assert_eq!(check("2026"), Err(ValidationError::YearRange { min: 1900, max: 2025 }));
        assert_eq!(check("2025"), Ok(()));
    }

    #[test]
    fn image_constraints() {
        let mut album = valid();
        album.image_size = 0;
        assert_eq!(album.validate(2024), Err(ValidationError::ImageSize(0)));

        let mut album = valid();
        album.image_size = MAX_IMAGE_SIZE + 1;
        assert!(matches!(album.validate(2024), Err(ValidationError::ImageSize(_))));

        let mut album = valid();
        album.content_type = "image/webp".to_string();
        assert_eq!(
            album.validate(2024),
            Err(ValidationError::ContentType("image/webp".to_string()))
        );
    }
}
