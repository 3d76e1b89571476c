//! Worker pool: N independent processors over one queue and one registry.
//!
//! Workers never talk to each other. The queue is the only coordination
//! point: a message handed to one worker stays invisible to the rest until
//! it is redelivered.
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! let handle = WorkerPool::new(queue, Arc::new(registry), config, 10).start();
//!
//! shutdown_signal().await;
//!
//! // Signals every worker and waits until all of them have left their loop.
//! let report = handle.shutdown().await;
//! ```

use crate::processor::{MessageProcessor, ProcessorConfig};
use crate::registry::HandlerRegistry;
use album_store_core::broker::MessageQueue;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the workers ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that returned from their loop.
    pub stopped: usize,
    /// Workers whose task panicked or was aborted.
    pub failed: usize,
}

impl ShutdownReport {
    /// `true` if every worker stopped cleanly.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Pool definition, not yet running.
pub struct WorkerPool {
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
    worker_count: usize,
}

impl WorkerPool {
    /// Define a pool of `worker_count` workers (at least one).
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
        worker_count: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            worker_count: worker_count.max(1),
        }
    }

    /// Spawn every worker.
    #[must_use]
    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..self.worker_count)
            .map(|worker_id| {
                let processor = MessageProcessor::new(
                    worker_id,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.registry),
                    self.config.clone(),
                );
                tokio::spawn(processor.run(shutdown_rx.clone()))
            })
            .collect();

        tracing::info!(
            workers = self.worker_count,
            event_types = ?self.registry.event_types().collect::<Vec<_>>(),
            "Worker pool started"
        );

        WorkerPoolHandle {
            shutdown_tx,
            workers,
        }
    }

    /// Start the pool, wait for `signal`, then shut down.
    pub async fn run_until<S>(self, signal: S) -> ShutdownReport
    where
        S: Future<Output = ()>,
    {
        let handle = self.start();
        signal.await;
        handle.shutdown().await
    }
}

/// Running pool.
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Number of spawned workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal cancellation and wait for every worker to exit.
    ///
    /// Batches already received are dispatched before their worker exits.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!(workers = self.workers.len(), "Shutting down worker pool");
        self.shutdown_tx.send_replace(true);

        let mut report = ShutdownReport::default();
        for (worker, handle) in self.workers.into_iter().enumerate() {
            match handle.await {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(worker, error = %e, "Worker task failed");
                }
            }
        }

        tracing::info!(stopped = report.stopped, failed = report.failed, "Worker pool stopped");
        report
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if setup fails
mod tests {
    use super::*;
    use album_store_core::event::{DomainEvent, EventType};
    use album_store_testing::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::default().with_wait_time(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn shutdown_waits_for_every_worker() {
        let queue = Arc::new(InMemoryQueue::new());
        let handle = WorkerPool::new(queue, Arc::new(HandlerRegistry::new()), fast_config(), 4).start();
        assert_eq!(handle.worker_count(), 4);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown should complete");

        assert_eq!(report, ShutdownReport { stopped: 4, failed: 0 });
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn workers_share_the_queue() {
        let queue = Arc::new(InMemoryQueue::new());
        for _ in 0..40 {
            queue
                .publish_event(&DomainEvent::album_liked("A1"))
                .expect("publish should succeed");
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let mut registry = HandlerRegistry::new();
        registry.register_fn(EventType::AlbumLiked, "count", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handle = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config(), 3).start();
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.len() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue should drain");
        handle.shutdown().await;

        assert_eq!(handled.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn batch_in_flight_at_shutdown_is_finished_and_acknowledged() {
        let queue = Arc::new(InMemoryQueue::new());
        for _ in 0..5 {
            queue
                .publish_event(&DomainEvent::album_liked("A1"))
                .expect("publish should succeed");
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let mut registry = HandlerRegistry::new();
        registry.register_fn(EventType::AlbumLiked, "slow", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handle = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config(), 1).start();
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("batch should be received");
        let calls_before_shutdown = queue.receive_calls();

        let report = handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(report.is_clean());
        assert_eq!(handled.load(Ordering::SeqCst), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.receive_calls(), calls_before_shutdown);
    }

    #[tokio::test]
    async fn run_until_returns_after_signal() {
        let queue = Arc::new(InMemoryQueue::new());
        let pool = WorkerPool::new(queue, Arc::new(HandlerRegistry::new()), fast_config(), 2);

        let report = pool
            .run_until(tokio::time::sleep(Duration::from_millis(30)))
            .await;

        assert_eq!(report.stopped, 2);
    }
}
