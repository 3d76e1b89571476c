//! Album store worker.
//!
//! Consumes album events from the Redis stream and maintains the review
//! aggregates. When `IMAGE_PROCESSOR_URL` is set, uploaded images are handed
//! to the processing function through a bounded dispatch queue.
//!
//! ```bash
//! REVIEW_BACKEND=postgres DATABASE_URL=postgres://localhost/albums \
//!     REDIS_URL=redis://localhost:6379 album-store-worker
//! ```

mod config;
mod image_client;

use album_store_core::album::AlbumWriteStore;
use album_store_core::broker::MessageQueue;
use album_store_core::review::ReviewRepository;
use album_store_postgres::{PostgresAlbumStore, PostgresReviewRepository};
use album_store_redis::{RedisReviewRepository, RedisStreamBroker};
use album_store_runtime::handlers::pipeline_registry;
use album_store_runtime::image_dispatch::ImageDispatchQueue;
use album_store_runtime::metrics::MetricsExporter;
use album_store_runtime::WorkerPool;
use anyhow::Context;
use config::{ReviewBackend, WorkerConfig};
use image_client::HttpImageProcessor;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "album_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    let backend = config.validate().context("Invalid configuration")?;

    MetricsExporter::new(config.metrics_addr)
        .install()
        .context("Failed to install metrics exporter")?;

    let broker = RedisStreamBroker::builder()
        .url(&config.stream.url)
        .stream(&config.stream.stream)
        .group(&config.stream.group)
        .consumer(format!("{}-{}", config.stream.consumer_prefix, std::process::id()))
        .visibility_timeout(config.stream.visibility_timeout)
        .build()
        .await
        .context("Failed to connect to the event stream")?;

    let pool = match &config.database.url {
        Some(url) => {
            let pool = album_store_postgres::connect(url, config.database.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            album_store_postgres::migrate(&pool)
                .await
                .context("Failed to run migrations")?;
            Some(pool)
        }
        None => None,
    };

    let reviews: Arc<dyn ReviewRepository> = match (backend, &pool) {
        (ReviewBackend::Postgres, Some(pool)) => Arc::new(PostgresReviewRepository::new(pool.clone())),
        // validate() guarantees a URL for postgres, so this arm is redis.
        _ => Arc::new(
            RedisReviewRepository::new(&config.stream.url, config.review_key_prefix.clone())
                .await
                .context("Failed to connect review repository")?,
        ),
    };

    let (images, image_task) = match &config.images.processor_url {
        Some(url) => {
            let processor = HttpImageProcessor::new(url.clone())
                .context("Failed to build image processing client")?;
            let mut builder = ImageDispatchQueue::builder(Arc::new(processor))
                .capacity(config.images.queue_capacity);
            if let Some(pool) = &pool {
                let store: Arc<dyn AlbumWriteStore> = Arc::new(PostgresAlbumStore::new(pool.clone()));
                builder = builder.thumbnail_store(store);
            }
            let (queue, task) = builder.spawn();
            (Some(queue), Some(task))
        }
        None => {
            tracing::info!("IMAGE_PROCESSOR_URL not set, image uploads will not be processed");
            (None, None)
        }
    };

    let registry = Arc::new(pipeline_registry(reviews, images));
    let queue: Arc<dyn MessageQueue> = Arc::new(broker);

    tracing::info!(
        workers = config.workers.count,
        backend = ?backend,
        stream = %config.stream.stream,
        "Album store worker starting"
    );

    let report = WorkerPool::new(queue, registry, config.processor_config(), config.workers.count)
        .run_until(shutdown_signal())
        .await;

    // The pool owned the last dispatch queue sender, so the task drains now.
    if let Some(task) = image_task {
        task.join().await;
    }

    if report.is_clean() {
        tracing::info!(stopped = report.stopped, "Album store worker stopped");
    } else {
        tracing::warn!(
            stopped = report.stopped,
            failed = report.failed,
            "Album store worker stopped with failed workers"
        );
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed, that signal is ignored and the other
/// one still works.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
