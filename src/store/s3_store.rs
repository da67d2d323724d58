//! S3 Object Store Implementation
//!
//! S3-compatible bucket client built on the `object_store` crate from the
//! Arrow ecosystem. Works against AWS S3 and S3-compatible services
//! (R2, MinIO, LocalStack) through a custom endpoint.
//!
//! Listing cursors are object keys: the next page is requested with
//! `list_with_offset`, which returns keys strictly after the offset.
//! Prefixes are matched on whole path segments, as `object_store` does.

use crate::config::BucketConfig;
use crate::store::object_store::{GetResponse, ListPage, ObjectMeta, ObjectStore, StoreFuture};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as ObjectStoreTrait;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// S3 Object Store for production deployments
#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store from bucket settings
    pub fn new(config: &BucketConfig) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.name)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key);

        // Use custom endpoint for S3-compatible services
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store for {}: {}", config.name, e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            bucket: config.name.clone(),
        })
    }

    /// Create from an existing object store (for testing)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, bucket: String) -> Self {
        S3ObjectStore { store, bucket }
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }

    fn to_meta(meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            key: meta.location.to_string(),
            size_bytes: meta.size as u64,
            etag: meta.e_tag,
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let prefix = prefix.filter(|p| !p.is_empty()).map(ObjectPath::from);
            let offset = continuation_token.map(ObjectPath::from);
            let max_keys = max_keys.max(1);

            let mut stream = match &offset {
                Some(offset) => self.store.list_with_offset(prefix.as_ref(), offset),
                None => self.store.list(prefix.as_ref()),
            };

            // One extra entry tells us whether another page exists
            let mut objects = Vec::with_capacity(max_keys + 1);
            while objects.len() <= max_keys {
                match stream.next().await {
                    Some(meta) => objects.push(Self::to_meta(meta.map_err(Self::map_error)?)),
                    None => break,
                }
            }

            let next_token = if objects.len() > max_keys {
                objects.truncate(max_keys);
                objects.last().map(|o| o.key.clone())
            } else {
                None
            };

            Ok(ListPage {
                objects,
                next_token,
            })
        })
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match self.store.head(&ObjectPath::from(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        Box::pin(async move {
            let result = match self.store.get(&ObjectPath::from(key)).await {
                Ok(result) => result,
                Err(object_store::Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(Self::map_error(e)),
            };
            let etag = result.meta.e_tag.clone();
            let size_bytes = result.meta.size as u64;
            let body = result.bytes().await.map_err(Self::map_error)?;
            Ok(Some(GetResponse {
                body: body.to_vec(),
                etag,
                size_bytes,
            }))
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.store
                .put(
                    &ObjectPath::from(key),
                    bytes::Bytes::copy_from_slice(data).into(),
                )
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }
}
