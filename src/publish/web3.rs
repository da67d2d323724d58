//! web3.storage upload client

use super::{PublishError, PublishFuture, Publisher};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::info;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct UploadResponse {
    cid: String,
}

/// Uploads the manifest with `POST {endpoint}/upload`
pub struct Web3StoragePublisher {
    client: Client,
    endpoint: String,
    token: String,
}

impl std::fmt::Debug for Web3StoragePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Web3StoragePublisher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Web3StoragePublisher {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Web3StoragePublisher {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn upload_url(&self) -> String {
        format!("{}/upload", self.endpoint)
    }
}

impl Publisher for Web3StoragePublisher {
    fn publish<'a>(&'a self, path: &'a Path, name: &'a str) -> PublishFuture<'a> {
        Box::pin(async move {
            // Streamed from disk; the manifest can be larger than memory
            let file = tokio::fs::File::open(path).await?;
            let size = file.metadata().await?.len();

            let response = self
                .client
                .post(self.upload_url())
                .bearer_auth(&self.token)
                .header("X-Name", name)
                .header(CONTENT_LENGTH, size)
                .body(Body::wrap_stream(ReaderStream::new(file)))
                .send()
                .await
                .map_err(|e| PublishError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PublishError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: UploadResponse = response
                .json()
                .await
                .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;
            info!(cid = %parsed.cid, name, bytes = size, "manifest uploaded");
            Ok(parsed.cid)
        })
    }
}
