//! Review aggregate counters in Redis hashes.
//!
//! One hash per album at `{prefix}:{album_id}` with `like_count` and
//! `dislike_count`. `HINCRBY` is atomic on the server and creates both the
//! key and the field on first use, so no locking is needed.

use album_store_core::review::{
    RepositoryError, Result, ReviewAggregate, ReviewKind, ReviewRepository,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &redis::RedisError) -> RepositoryError {
    RepositoryError::Storage(format!("{context}: {error}"))
}

/// Redis [`ReviewRepository`].
#[derive(Clone)]
pub struct RedisReviewRepository {
    conn_manager: ConnectionManager,
    key_prefix: String,
}

impl RedisReviewRepository {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Storage`] if the URL is invalid or Redis is
    /// unreachable.
    pub async fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| storage("Failed to create Redis client", &e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| storage("Failed to create Redis connection manager", &e))?;
        Ok(Self::from_connection(conn_manager, key_prefix))
    }

    /// Repository over an existing connection manager.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn_manager,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, album_id: &str) -> String {
        format!("{}:{album_id}", self.key_prefix)
    }
}

fn parse_counter(album_id: &str, fields: &HashMap<String, String>, kind: ReviewKind) -> Result<u64> {
    fields.get(kind.counter_field()).map_or(Ok(0), |raw| {
        raw.parse().map_err(|_| RepositoryError::Corrupt {
            album_id: album_id.to_string(),
            reason: format!("{} is not a count: {raw:?}", kind.counter_field()),
        })
    })
}

impl ReviewRepository for RedisReviewRepository {
    fn get_by_album<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReviewAggregate>>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let fields: HashMap<String, String> = conn
                .hgetall(self.key(album_id))
                .await
                .map_err(|e| storage("Failed to load reviews", &e))?;
            if fields.is_empty() {
                return Ok(None);
            }

            Ok(Some(ReviewAggregate::new(
                album_id,
                parse_counter(album_id, &fields, ReviewKind::Like)?,
                parse_counter(album_id, &fields, ReviewKind::Dislike)?,
            )))
        })
    }

    fn increment<'a>(
        &'a self,
        album_id: &'a str,
        kind: ReviewKind,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let other = match kind {
                ReviewKind::Like => ReviewKind::Dislike,
                ReviewKind::Dislike => ReviewKind::Like,
            };
            let key = self.key(album_id);
            let mut conn = self.conn_manager.clone();

            let _: () = redis::pipe()
                .atomic()
                .hincr(&key, kind.counter_field(), 1)
                .ignore()
                .hset_nx(&key, other.counter_field(), 0)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| storage("Failed to increment review counter", &e))?;

            metrics::counter!(
                "review_repository_increments_total",
                "backend" => "redis",
                "counter" => kind.counter_field()
            )
            .increment(1);
            tracing::trace!(album_id, counter = kind.counter_field(), "Review counter incremented");
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        album_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: i64 = conn
                .del(self.key(album_id))
                .await
                .map_err(|e| storage("Failed to delete reviews", &e))?;
            if removed == 0 {
                return Err(RepositoryError::NotFound(album_id.to_string()));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_counter_reads_as_zero() {
        let fields = HashMap::from([("like_count".to_string(), "4".to_string())]);

        assert!(matches!(parse_counter("A1", &fields, ReviewKind::Like), Ok(4)));
        assert!(matches!(parse_counter("A1", &fields, ReviewKind::Dislike), Ok(0)));
    }

    #[test]
    fn non_numeric_counter_is_corrupt() {
        let fields = HashMap::from([("dislike_count".to_string(), "lots".to_string())]);

        assert!(matches!(
            parse_counter("A1", &fields, ReviewKind::Dislike),
            Err(RepositoryError::Corrupt { album_id, .. }) if album_id == "A1"
        ));
    }
}
