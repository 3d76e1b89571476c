//! Album write store in `albums` and `review_intents`.

use album_store_core::album::{Album, AlbumStoreError, AlbumWriteStore};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &sqlx::Error) -> AlbumStoreError {
    AlbumStoreError::Storage(format!("{context}: {error}"))
}

/// Relational [`AlbumWriteStore`].
#[derive(Clone)]
pub struct PostgresAlbumStore {
    pool: PgPool,
}

impl PostgresAlbumStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Review intents of an album in insertion order, `true` for likes.
    ///
    /// # Errors
    ///
    /// Returns [`AlbumStoreError::Storage`] if the query fails.
    pub async fn review_intents(&self, album_id: &str) -> Result<Vec<bool>, AlbumStoreError> {
        let rows: Vec<(bool,)> =
            sqlx::query_as("SELECT liked FROM review_intents WHERE album_id = $1 ORDER BY id")
                .bind(album_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("Failed to load review intents", &e))?;
        Ok(rows.into_iter().map(|(liked,)| liked).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AlbumRow {
    album_id: String,
    artist: String,
    title: String,
    year: String,
    image_id: String,
    image_size: i64,
    thumbnail_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AlbumRow> for Album {
    fn from(row: AlbumRow) -> Self {
        Self {
            album_id: row.album_id,
            artist: row.artist,
            title: row.title,
            year: row.year,
            image_id: row.image_id,
            image_size: row.image_size,
            thumbnail_key: row.thumbnail_key,
            created_at: row.created_at,
        }
    }
}

impl AlbumWriteStore for PostgresAlbumStore {
    fn save_album<'a>(
        &'a self,
        album: &'a Album,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO albums
                    (album_id, artist, title, year, image_id, image_size, thumbnail_key, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&album.album_id)
            .bind(&album.artist)
            .bind(&album.title)
            .bind(&album.year)
            .bind(&album.image_id)
            .bind(album.image_size)
            .bind(&album.thumbnail_key)
            .bind(album.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to insert album", &e))?;
            Ok(())
        })
    }

    fn get_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Album>, AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            let row: Option<AlbumRow> = sqlx::query_as(
                "SELECT album_id, artist, title, year, image_id, image_size, thumbnail_key, created_at
                 FROM albums WHERE album_id = $1",
            )
            .bind(album_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to load album", &e))?;
            Ok(row.map(Album::from))
        })
    }

    fn save_review_intent<'a>(
        &'a self,
        album_id: &'a str,
        liked: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query("INSERT INTO review_intents (album_id, liked) VALUES ($1, $2)")
                .bind(album_id)
                .bind(liked)
                .execute(&self.pool)
                .await
                .map_err(|e| storage("Failed to record review intent", &e))?;
            Ok(())
        })
    }

    fn set_thumbnail_key<'a>(
        &'a self,
        album_id: &'a str,
        thumbnail_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlbumStoreError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE albums SET thumbnail_key = $2 WHERE album_id = $1")
                .bind(album_id)
                .bind(thumbnail_key)
                .execute(&self.pool)
                .await
                .map_err(|e| storage("Failed to record thumbnail", &e))?;
            if result.rows_affected() == 0 {
                return Err(AlbumStoreError::NotFound(album_id.to_string()));
            }
            Ok(())
        })
    }
}
