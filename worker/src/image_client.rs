//! HTTP client for the image processing function.

use album_store_core::image::{ImageError, ImageProcessor, ProcessImageRequest};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Posts [`ProcessImageRequest`]s as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpImageProcessor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpImageProcessor {
    /// Client for `endpoint` with a 10 second request timeout.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

fn failed(request: &ProcessImageRequest, reason: impl ToString) -> ImageError {
    ImageError::ProcessingFailed {
        source_key: request.source_key.clone(),
        reason: reason.to_string(),
    }
}

impl ImageProcessor for HttpImageProcessor {
    fn submit(
        &self,
        request: ProcessImageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), ImageError>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| failed(&request, e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(failed(&request, format!("endpoint returned {status}")));
            }

            tracing::debug!(
                source_key = %request.source_key,
                destination_key = %request.destination_key,
                "Image processing requested"
            );
            Ok(())
        })
    }
}
