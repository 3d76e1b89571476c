//! Contract with the external image processing function.
//!
//! Thumbnail generation happens outside this system. Workers only hand it a
//! source and a destination key and do not wait for the result.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised when submitting image work.
#[derive(Error, Debug)]
pub enum ImageError {
    /// The bounded submission queue has no free slot.
    #[error("Image processing queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The dispatch task has stopped.
    #[error("Image processing queue is closed")]
    QueueClosed,

    /// The processing function rejected or failed the request.
    #[error("Image processing failed for {source_key}: {reason}")]
    ProcessingFailed {
        /// Source object key.
        source_key: String,
        /// Underlying failure.
        reason: String,
    },
}

/// Request body sent to the processing function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImageRequest {
    /// Blob key of the uploaded original.
    pub source_key: String,
    /// Blob key the thumbnail is written to.
    pub destination_key: String,
}

impl ProcessImageRequest {
    /// Keys for an album cover: `images/{album}/{image}` and its `-thumb` sibling.
    #[must_use]
    pub fn for_album_image(album_id: &str, image_id: &str) -> Self {
        let source_key = original_image_key(album_id, image_id);
        let destination_key = format!("{source_key}-thumb");
        Self {
            source_key,
            destination_key,
        }
    }
}

/// Blob key of an uploaded album image.
#[must_use]
pub fn original_image_key(album_id: &str, image_id: &str) -> String {
    format!("images/{album_id}/{image_id}")
}

/// Fire-and-forget access to the image processing function.
pub trait ImageProcessor: Send + Sync {
    /// Submit one request.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::ProcessingFailed`] if the function could not be invoked.
    fn submit(
        &self,
        request: ProcessImageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), ImageError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_image_keys_follow_storage_layout() {
        let request = ProcessImageRequest::for_album_image("A1", "img-7");

        assert_eq!(request.source_key, "images/A1/img-7");
        assert_eq!(request.destination_key, "images/A1/img-7-thumb");

        let json = serde_json::to_value(&request).unwrap_or_default();
        assert_eq!(json["sourceKey"], "images/A1/img-7");
        assert_eq!(json["destinationKey"], "images/A1/img-7-thumb");
    }
}
