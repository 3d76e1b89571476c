//! Bounded queue in front of the image processing function.
//!
//! Handlers must not block on thumbnail generation, but they also must not
//! spawn unsupervised tasks. Jobs go into a fixed-capacity channel drained by
//! a single supervised task that runs a few of them at a time. When the
//! channel is full, submission fails immediately and the handler reports an
//! error, so the originating message is redelivered later instead of the job
//! being lost.
//!
//! After a job succeeds the thumbnail key is recorded in the write store, if
//! one was configured.

use crate::metrics::ImageDispatchMetrics;
use album_store_core::album::AlbumWriteStore;
use album_store_core::image::{ImageError, ImageProcessor, ProcessImageRequest};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct ImageJob {
    album_id: String,
    request: ProcessImageRequest,
}

/// Sending half, cheap to clone into handlers.
#[derive(Debug, Clone)]
pub struct ImageDispatchQueue {
    tx: mpsc::Sender<ImageJob>,
    capacity: usize,
}

impl ImageDispatchQueue {
    /// Start configuring a dispatcher for `processor`.
    #[must_use]
    pub fn builder(processor: Arc<dyn ImageProcessor>) -> ImageDispatchBuilder {
        ImageDispatchBuilder {
            processor,
            capacity: 100,
            concurrency: 4,
            thumbnails: None,
        }
    }

    /// Enqueue a job without waiting.
    ///
    /// # Errors
    ///
    /// - [`ImageError::QueueFull`] if every slot is taken
    /// - [`ImageError::QueueClosed`] if the dispatch task has stopped
    pub fn try_submit(&self, album_id: &str, request: ProcessImageRequest) -> Result<(), ImageError> {
        let job = ImageJob {
            album_id: album_id.to_string(),
            request,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                ImageDispatchMetrics::record_submitted();
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                ImageDispatchMetrics::record_rejected();
                tracing::warn!(
                    album_id = %job.album_id,
                    capacity = self.capacity,
                    "Image dispatch queue full"
                );
                Err(ImageError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(ImageError::QueueClosed),
        }
    }
}

/// Builder for [`ImageDispatchQueue`].
pub struct ImageDispatchBuilder {
    processor: Arc<dyn ImageProcessor>,
    capacity: usize,
    concurrency: usize,
    thumbnails: Option<Arc<dyn AlbumWriteStore>>,
}

impl ImageDispatchBuilder {
    /// Maximum queued jobs (default 100).
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Jobs run at the same time (default 4).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Record thumbnail keys in `store` after successful jobs.
    #[must_use]
    pub fn thumbnail_store(mut self, store: Arc<dyn AlbumWriteStore>) -> Self {
        self.thumbnails = Some(store);
        self
    }

    /// Spawn the dispatch task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(self) -> (ImageDispatchQueue, ImageDispatchTask) {
        let (tx, mut rx) = mpsc::channel::<ImageJob>(self.capacity);
        let processor = self.processor;
        let thumbnails = self.thumbnails;
        let concurrency = self.concurrency;

        let handle = tokio::spawn(async move {
            futures::stream::poll_fn(|cx| rx.poll_recv(cx))
                .for_each_concurrent(concurrency, |job| {
                    run_job(Arc::clone(&processor), thumbnails.clone(), job)
                })
                .await;
            tracing::debug!("Image dispatch task drained");
        });

        let queue = ImageDispatchQueue {
            tx,
            capacity: self.capacity,
        };
        (queue, ImageDispatchTask { handle })
    }
}

async fn run_job(
    processor: Arc<dyn ImageProcessor>,
    thumbnails: Option<Arc<dyn AlbumWriteStore>>,
    job: ImageJob,
) {
    let destination = job.request.destination_key.clone();
    if let Err(e) = processor.submit(job.request).await {
        ImageDispatchMetrics::record_failure();
        tracing::error!(album_id = %job.album_id, error = %e, "Image processing failed");
        return;
    }

    if let Some(store) = thumbnails {
        if let Err(e) = store.set_thumbnail_key(&job.album_id, &destination).await {
            tracing::error!(album_id = %job.album_id, error = %e, "Failed to record thumbnail key");
        }
    }
}

/// Handle on the dispatch task.
pub struct ImageDispatchTask {
    handle: JoinHandle<()>,
}

impl ImageDispatchTask {
    /// Wait for the task to finish.
    ///
    /// The task ends once every [`ImageDispatchQueue`] clone is dropped and the
    /// queued jobs have run.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Image dispatch task failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Panics: Test will fail if setup fails
mod tests {
    use super::*;
    use album_store_testing::{InMemoryAlbumStore, RecordingImageProcessor};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_reach_the_processor_and_record_thumbnails() {
        let processor = Arc::new(RecordingImageProcessor::new());
        let store = Arc::new(InMemoryAlbumStore::new());
        store.insert_album(InMemoryAlbumStore::sample_album("A1"));

        let (queue, task) = ImageDispatchQueue::builder(processor.clone())
            .thumbnail_store(store.clone())
            .spawn();
        queue
            .try_submit("A1", ProcessImageRequest::for_album_image("A1", "img"))
            .expect("queue has room");
        drop(queue);
        task.join().await;

        assert_eq!(
            processor.requests(),
            vec![ProcessImageRequest::for_album_image("A1", "img")]
        );
        let album = store.album("A1").expect("album exists");
        assert_eq!(album.thumbnail_key.as_deref(), Some("images/A1/img-thumb"));
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_growing() {
        let processor = Arc::new(RecordingImageProcessor::new().with_delay(Duration::from_millis(200)));
        let (queue, _task) = ImageDispatchQueue::builder(processor)
            .capacity(1)
            .concurrency(1)
            .spawn();

        let request = || ProcessImageRequest::for_album_image("A1", "img");
        let results: Vec<_> = (0..5).map(|_| queue.try_submit("A1", request())).collect();

        assert!(results[0].is_ok());
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(ImageError::QueueFull { capacity: 1 })))
        );
    }

    #[tokio::test]
    async fn processor_failures_are_contained() {
        let processor = Arc::new(RecordingImageProcessor::new().failing());
        let (queue, task) = ImageDispatchQueue::builder(processor.clone()).spawn();

        queue
            .try_submit("A1", ProcessImageRequest::for_album_image("A1", "img"))
            .expect("queue has room");
        drop(queue);
        task.join().await;

        assert_eq!(processor.requests().len(), 1);
    }
}
