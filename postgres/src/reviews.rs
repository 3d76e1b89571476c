//! Review aggregate counters in `album_reviews`.
//!
//! ```sql
//! CREATE TABLE album_reviews (
//!     album_id TEXT PRIMARY KEY,
//!     like_count BIGINT NOT NULL DEFAULT 0,
//!     dislike_count BIGINT NOT NULL DEFAULT 0,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! An increment runs in one transaction: lock the album's row, then either
//! bump the counter or insert a seeded row. Two transactions can both find
//! no row to lock; the insert's `ON CONFLICT` arm turns the loser into an
//! increment, so no count is lost either way.

use album_store_core::review::{
    RepositoryError, Result, ReviewAggregate, ReviewKind, ReviewRepository,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(format!("{context}: {error}"))
}

/// Relational [`ReviewRepository`].
#[derive(Clone)]
pub struct PostgresReviewRepository {
    pool: PgPool,
}

impl PostgresReviewRepository {
    /// Repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    album_id: String,
    like_count: i64,
    dislike_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReviewRow> for ReviewAggregate {
    type Error = RepositoryError;

    fn try_from(row: ReviewRow) -> Result<Self> {
        let count = |value: i64, field: &str| {
            u64::try_from(value).map_err(|_| RepositoryError::Corrupt {
                album_id: row.album_id.clone(),
                reason: format!("negative {field}: {value}"),
            })
        };
        let like_count = count(row.like_count, "like_count")?;
        let dislike_count = count(row.dislike_count, "dislike_count")?;

        Ok(Self {
            like_count,
            dislike_count,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
            album_id: row.album_id,
        })
    }
}

impl ReviewRepository for PostgresReviewRepository {
    fn get_by_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReviewAggregate>>> + Send + 'a>> {
        Box::pin(async move {
            let row: Option<ReviewRow> = sqlx::query_as(
                "SELECT album_id, like_count, dislike_count, created_at, updated_at
                 FROM album_reviews WHERE album_id = $1",
            )
            .bind(album_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to load reviews", &e))?;

            row.map(ReviewAggregate::try_from).transpose()
        })
    }

    fn increment<'a>(
        &'a self,
        album_id: &'a str,
        kind: ReviewKind,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            // Column names come from a closed enum, never from input.
            let column = kind.counter_field();

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage("Failed to begin transaction", &e))?;

            let locked: Option<(String,)> =
                sqlx::query_as("SELECT album_id FROM album_reviews WHERE album_id = $1 FOR UPDATE")
                    .bind(album_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| storage("Failed to lock review row", &e))?;

            let statement = if locked.is_some() {
                format!(
                    "UPDATE album_reviews SET {column} = {column} + 1, updated_at = now()
                     WHERE album_id = $1"
                )
            } else {
                format!(
                    "INSERT INTO album_reviews (album_id, {column}, created_at, updated_at)
                     VALUES ($1, 1, now(), now())
                     ON CONFLICT (album_id) DO UPDATE
                     SET {column} = album_reviews.{column} + 1, updated_at = now()"
                )
            };

            sqlx::query(&statement)
                .bind(album_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage("Failed to increment review counter", &e))?;

            tx.commit()
                .await
                .map_err(|e| storage("Failed to commit review increment", &e))?;

            metrics::counter!(
                "review_repository_increments_total",
                "backend" => "postgres",
                "counter" => column
            )
            .increment(1);
            tracing::trace!(album_id, counter = column, created = locked.is_none(), "Review counter incremented");
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM album_reviews WHERE album_id = $1")
                .bind(album_id)
                .execute(&self.pool)
                .await
                .map_err(|e| storage("Failed to delete reviews", &e))?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound(album_id.to_string()));
            }
            Ok(())
        })
    }
}
