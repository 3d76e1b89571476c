//! Worker configuration loaded from environment variables.
//!
//! Every setting has a default except the database URL, which is only
//! required by the `postgres` review backend. Values that are present but
//! unparseable are reported instead of silently replaced by the default.

use album_store_runtime::processor::ProcessorConfig;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to something that does not parse.
    #[error("{key} has an invalid value: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// `REVIEW_BACKEND` names no known backend.
    #[error("unknown review backend {0:?} (expected \"postgres\" or \"redis\")")]
    UnknownBackend(String),

    /// `WORKER_COUNT` is zero.
    #[error("WORKER_COUNT must be at least 1")]
    ZeroWorkers,

    /// `RETRY_CEILING` is zero.
    #[error("RETRY_CEILING must be at least 1")]
    ZeroRetryCeiling,

    /// The postgres backend was chosen without `DATABASE_URL`.
    #[error("DATABASE_URL is required for the postgres review backend")]
    MissingDatabaseUrl,
}

/// Where review aggregates are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewBackend {
    /// `album_reviews` table.
    Postgres,
    /// One Redis hash per album.
    Redis,
}

/// Redis Streams settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Redis connection URL.
    pub url: String,
    /// Stream key events are published to.
    pub stream: String,
    /// Consumer group shared by all workers.
    pub group: String,
    /// Prefix of this process's consumer name.
    pub consumer_prefix: String,
    /// Idle time before an unacknowledged entry is redelivered.
    pub visibility_timeout: Duration,
}

/// `PostgreSQL` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Connection URL, if a database is used at all.
    pub url: Option<String>,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
}

/// Per-worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Number of workers.
    pub count: usize,
    /// Batch limit per receive.
    pub max_messages: usize,
    /// Long-poll wait.
    pub wait_time: Duration,
    /// Deliveries after which a failing message is dropped.
    pub retry_ceiling: u32,
    /// Delay after a failed receive.
    pub backoff: Duration,
    /// Messages of one batch processed at the same time.
    pub max_in_flight: usize,
}

/// Image processing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Endpoint of the image processing function. No image handler without it.
    pub processor_url: Option<String>,
    /// Capacity of the bounded dispatch queue.
    pub queue_capacity: usize,
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Broker.
    pub stream: StreamConfig,
    /// Database.
    pub database: DatabaseConfig,
    /// Raw `REVIEW_BACKEND` value, checked by [`validate`](Self::validate).
    pub review_backend: String,
    /// Key prefix of the Redis review hashes.
    pub review_key_prefix: String,
    /// Worker tuning.
    pub workers: WorkerSettings,
    /// Image processing.
    pub images: ImageConfig,
    /// Prometheus listener address.
    pub metrics_addr: SocketAddr,
}

impl WorkerConfig {
    /// Load from the process environment, after reading `.env` if present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &'static str, default: u64| {
            parse_var(&lookup, key, default).map(Duration::from_secs)
        };

        Ok(Self {
            stream: StreamConfig {
                url: string("REDIS_URL", "redis://localhost:6379"),
                stream: string("EVENTS_STREAM", "album-events"),
                group: string("EVENTS_CONSUMER_GROUP", "album-workers"),
                consumer_prefix: string("CONSUMER_NAME_PREFIX", "worker"),
                visibility_timeout: secs("VISIBILITY_TIMEOUT_SECS", 30)?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            },
            review_backend: string("REVIEW_BACKEND", "postgres").trim().to_lowercase(),
            review_key_prefix: string("REVIEW_KEY_PREFIX", "album_reviews"),
            workers: WorkerSettings {
                count: parse_var(&lookup, "WORKER_COUNT", 10)?,
                max_messages: parse_var(&lookup, "MAX_MESSAGES", 10)?,
                wait_time: secs("WAIT_TIME_SECS", 20)?,
                retry_ceiling: parse_var(&lookup, "RETRY_CEILING", 3)?,
                backoff: secs("BACKOFF_SECS", 5)?,
                max_in_flight: parse_var(&lookup, "MAX_IN_FLIGHT", 10)?,
            },
            images: ImageConfig {
                processor_url: lookup("IMAGE_PROCESSOR_URL").filter(|url| !url.trim().is_empty()),
                queue_capacity: parse_var(&lookup, "IMAGE_QUEUE_CAPACITY", 100)?,
            },
            metrics_addr: parse_var(&lookup, "METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 9090)))?,
        })
    }

    /// Check cross-field rules and resolve the review backend.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ZeroWorkers`] / [`ConfigError::ZeroRetryCeiling`]
    /// - [`ConfigError::UnknownBackend`] for an unrecognized backend name
    /// - [`ConfigError::MissingDatabaseUrl`] for `postgres` without a URL
    pub fn validate(&self) -> Result<ReviewBackend, ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.workers.retry_ceiling == 0 {
            return Err(ConfigError::ZeroRetryCeiling);
        }
        let backend = match self.review_backend.as_str() {
            "postgres" => ReviewBackend::Postgres,
            "redis" => ReviewBackend::Redis,
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };
        if backend == ReviewBackend::Postgres && self.database.url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        Ok(backend)
    }

    /// Processor tunables derived from the worker settings.
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default()
            .with_max_messages(self.workers.max_messages)
            .with_wait_time(self.workers.wait_time)
            .with_retry_ceiling(self.workers.retry_ceiling)
            .with_poll_error_backoff(self.workers.backoff)
            .with_max_in_flight(self.workers.max_in_flight)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}
