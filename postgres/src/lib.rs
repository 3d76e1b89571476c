//! `PostgreSQL` storage for the album store.
//!
//! - [`PostgresReviewRepository`]: review aggregate counters, serialized per
//!   album with a row lock
//! - [`PostgresAlbumStore`]: authoritative album and review intent writes
//!
//! Both share one `sqlx` pool. [`migrate`] creates the tables.
//!
//! # Example
//!
//! ```ignore
//! use album_store_postgres::{PostgresReviewRepository, connect, migrate};
//!
//! let pool = connect("postgres://localhost/albums", 10).await?;
//! migrate(&pool).await?;
//! let reviews = PostgresReviewRepository::new(pool);
//! reviews.add_like("A1").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod albums;
mod reviews;

pub use albums::PostgresAlbumStore;
pub use reviews::PostgresReviewRepository;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Create or upgrade the album store tables.
///
/// # Errors
///
/// Returns the migration error if a script fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
