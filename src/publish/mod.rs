//! Publishing the merged manifest
//!
//! A `Publisher` takes the manifest file and a display name and returns
//! the content identifier it was published under. Publishing is attempted
//! once; on failure the manifest stays on disk for a manual retry.

use crate::diff::ContentId;
use crate::store::ObjectStore;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use tracing::info;

#[cfg(feature = "web3")]
mod web3;
#[cfg(feature = "web3")]
pub use web3::Web3StoragePublisher;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("reading manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("publish request failed: {0}")]
    Transport(String),
    #[error("publish rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected publish response: {0}")]
    InvalidResponse(String),
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<String, PublishError>> + Send + 'a>>;

pub trait Publisher: Send + Sync {
    /// Publish the file at `path` as `name`, returning its content identifier
    fn publish<'a>(&'a self, path: &'a Path, name: &'a str) -> PublishFuture<'a>;
}

/// Stores the manifest in an `ObjectStore` under its own raw-codec CID
#[derive(Debug, Clone)]
pub struct StorePublisher<S> {
    store: S,
}

impl<S: ObjectStore> StorePublisher<S> {
    pub fn new(store: S) -> Self {
        StorePublisher { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ObjectStore> Publisher for StorePublisher<S> {
    fn publish<'a>(&'a self, path: &'a Path, name: &'a str) -> PublishFuture<'a> {
        Box::pin(async move {
            let data = tokio::fs::read(path).await?;
            let cid = ContentId::raw_of(&data).to_string();
            self.store.put(&cid, &data).await?;
            info!(%cid, name, bytes = data.len(), "manifest stored");
            Ok(cid)
        })
    }
}
