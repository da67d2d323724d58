//! Object Store Abstraction
//!
//! Trait-based abstraction over the bucket operations the diff needs:
//! paginated listing plus `has`/`get`/`put` for the update phase.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and DST
//! - `LocalFsObjectStore`: For development and local runs
//! - `S3ObjectStore`: For production (feature-gated)
//!
//! Pagination contract: a continuation token is the last key of the
//! previous page, and the next page starts strictly after it. Listings
//! are ordered by key. Absence of `next_token` means end of listing.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{ErrorKind, Result as IoResult};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by every `ObjectStore` method
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Metadata for a listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// ETag or content hash (optional)
    pub etag: Option<String>,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page, ordered by key
    pub objects: Vec<ObjectMeta>,
    /// Continuation token for the next page (if more results exist)
    pub next_token: Option<String>,
}

/// Body and metadata returned by `get`
#[derive(Debug, Clone)]
pub struct GetResponse {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// List at most `max_keys` objects under `prefix`, starting after
    /// `continuation_token`
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage>;

    /// Check if an object exists
    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Get an object's contents, `None` if absent
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>>;

    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        (**self).list_page(prefix, max_keys, continuation_token)
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).has(key)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        (**self).get(key)
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }
}

/// Cut an ordered key listing into one page.
///
/// `objects` must already be sorted and start strictly after the
/// caller's token. The returned token is the last key of the page when more
/// objects remain.
fn paginate<I>(objects: I, max_keys: usize) -> ListPage
where
    I: Iterator<Item = ObjectMeta>,
{
    let max_keys = max_keys.max(1);
    let mut objects = objects.take(max_keys + 1).collect::<Vec<_>>();
    let next_token = if objects.len() > max_keys {
        objects.truncate(max_keys);
        objects.last().map(|o| o.key.clone())
    } else {
        None
    };
    ListPage {
        objects,
        next_token,
    }
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store for unit tests and deterministic simulation
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    /// Create a new in-memory object store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object synchronously (for seeding tests)
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.data.write().insert(key.into(), data.into());
    }

    /// All keys in listing order
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Clone for InMemoryObjectStore {
    fn clone(&self) -> Self {
        InMemoryObjectStore {
            data: Arc::clone(&self.data),
        }
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let prefix = prefix.unwrap_or("");
            let data = self.data.read();
            let start = match continuation_token {
                Some(token) => Bound::Excluded(token.to_string()),
                None => Bound::Included(prefix.to_string()),
            };
            let objects = data
                .range((start, Bound::Unbounded))
                .skip_while(|(k, _)| !k.starts_with(prefix) && k.as_str() < prefix)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                    etag: None,
                });
            Ok(paginate(objects, max_keys))
        })
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        Box::pin(async move {
            Ok(self.data.read().get(key).map(|body| GetResponse {
                size_bytes: body.len() as u64,
                body: body.clone(),
                etag: None,
            }))
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store for development and testing.
///
/// Keys map to paths under `base_path` with `/` as the separator. A listing
/// that starts without a token walks the tree once and keeps the sorted
/// keys; pages that continue from a token are cut from that snapshot, so
/// files added mid-listing show up on the next fresh listing.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
    snapshot: Arc<Mutex<Option<Snapshot>>>,
}

#[derive(Debug)]
struct Snapshot {
    prefix: String,
    objects: Arc<Vec<ObjectMeta>>,
}

impl LocalFsObjectStore {
    /// Create a new local filesystem object store
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore {
            base_path,
            snapshot: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the full path for a key
    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    /// Get the base path (for testing)
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Collect every file key under `dir`, as `/`-separated paths
    /// relative to `base`.
    fn walk_dir(dir: &Path, base: &Path, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                Self::walk_dir(&path, base, objects)?;
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                objects.push(ObjectMeta {
                    key,
                    size_bytes: entry.metadata()?.len(),
                    etag: None,
                });
            }
        }
        Ok(())
    }

    /// Sorted keys under `prefix`, reused while a listing continues
    async fn sorted_keys(&self, prefix: &str, fresh: bool) -> IoResult<Arc<Vec<ObjectMeta>>> {
        let cached = if fresh {
            None
        } else {
            self.snapshot
                .lock()
                .as_ref()
                .filter(|s| s.prefix == prefix)
                .map(|s| Arc::clone(&s.objects))
        };
        if let Some(objects) = cached {
            return Ok(objects);
        }

        let base = self.base_path.clone();
        let owned_prefix = prefix.to_string();
        let objects = tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            if base.exists() {
                Self::walk_dir(&base, &base, &mut objects)?;
            }
            objects.retain(|o| o.key.starts_with(&owned_prefix));
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok::<_, std::io::Error>(objects)
        })
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))??;

        let objects = Arc::new(objects);
        *self.snapshot.lock() = Some(Snapshot {
            prefix: prefix.to_string(),
            objects: Arc::clone(&objects),
        });
        Ok(objects)
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let objects = self
                .sorted_keys(prefix.unwrap_or(""), continuation_token.is_none())
                .await?;
            let start = continuation_token
                .map_or(0, |t| objects.partition_point(|o| o.key.as_str() <= t));
            Ok(paginate(objects[start..].iter().cloned(), max_keys))
        })
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match tokio::fs::metadata(self.full_path(key)).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        Box::pin(async move {
            match tokio::fs::read(self.full_path(key)).await {
                Ok(body) => Ok(Some(GetResponse {
                    size_bytes: body.len() as u64,
                    body,
                    etag: None,
                })),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(page: &ListPage) -> Vec<&str> {
        page.objects.iter().map(|o| o.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("test/key1", b"hello world").await.unwrap();
        let got = store.get("test/key1").await.unwrap().unwrap();

        assert_eq!(got.body, b"hello world");
        assert_eq!(got.size_bytes, 11);
        assert!(store.get("test/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inmemory_has() {
        let store = InMemoryObjectStore::new();

        assert!(!store.has("test/key1").await.unwrap());
        store.put("test/key1", b"data").await.unwrap();
        assert!(store.has("test/key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_list_prefix() {
        let store = InMemoryObjectStore::new();
        store.insert("raw/a.car", "1");
        store.insert("raw/b.car", "22");
        store.insert("complete/c.car", "333");

        let page = store.list_page(Some("raw/"), 100, None).await.unwrap();
        assert_eq!(keys(&page), vec!["raw/a.car", "raw/b.car"]);
        assert_eq!(page.objects[1].size_bytes, 2);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_inmemory_list_paginates_strictly_forward() {
        let store = InMemoryObjectStore::new();
        for i in 0..5 {
            store.insert(format!("raw/{}.car", i), "x");
        }

        let first = store.list_page(None, 2, None).await.unwrap();
        assert_eq!(keys(&first), vec!["raw/0.car", "raw/1.car"]);
        assert_eq!(first.next_token.as_deref(), Some("raw/1.car"));

        let second = store
            .list_page(None, 2, first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(keys(&second), vec!["raw/2.car", "raw/3.car"]);

        let third = store
            .list_page(None, 2, second.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(keys(&third), vec!["raw/4.car"]);
        assert!(third.next_token.is_none());
    }

    #[tokio::test]
    async fn test_inmemory_exact_page_boundary_has_no_token() {
        let store = InMemoryObjectStore::new();
        store.insert("a", "x");
        store.insert("b", "x");

        let page = store.list_page(None, 2, None).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_localfs_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        store.put("raw/x/1.car", b"one").await.unwrap();
        store.put("raw/x/2.car", b"two").await.unwrap();
        store.put("other/3.car", b"three").await.unwrap();

        let got = store.get("raw/x/1.car").await.unwrap().unwrap();
        assert_eq!(got.body, b"one");
        assert!(store.has("raw/x/2.car").await.unwrap());
        assert!(!store.has("raw/x/9.car").await.unwrap());
        assert!(store.get("raw/x/9.car").await.unwrap().is_none());

        let page = store.list_page(Some("raw/"), 1, None).await.unwrap();
        assert_eq!(keys(&page), vec!["raw/x/1.car"]);
        let page = store
            .list_page(Some("raw/"), 1, page.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(keys(&page), vec!["raw/x/2.car"]);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_localfs_continues_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());
        for i in 1..=5 {
            store.put(&format!("raw/{}.car", i), b"x").await.unwrap();
        }

        let first = store.list_page(Some("raw/"), 2, None).await.unwrap();
        assert_eq!(keys(&first), vec!["raw/1.car", "raw/2.car"]);

        // Added after the walk: later pages of this listing do not see it
        store.put("raw/6.car", b"x").await.unwrap();
        let mut listed: Vec<String> = first.objects.iter().map(|o| o.key.clone()).collect();
        let mut token = first.next_token;
        while let Some(t) = token {
            let page = store.list_page(Some("raw/"), 2, Some(t.as_str())).await.unwrap();
            listed.extend(page.objects.iter().map(|o| o.key.clone()));
            token = page.next_token;
        }
        assert_eq!(listed, (1..=5).map(|i| format!("raw/{}.car", i)).collect::<Vec<_>>());

        let fresh = store.list_page(Some("raw/"), 10, None).await.unwrap();
        assert_eq!(fresh.objects.len(), 6);
    }

    #[tokio::test]
    async fn test_localfs_token_with_other_prefix_rewalks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());
        store.put("a/1.car", b"x").await.unwrap();
        store.put("b/1.car", b"x").await.unwrap();
        store.put("b/2.car", b"x").await.unwrap();

        store.list_page(Some("a/"), 10, None).await.unwrap();
        let page = store.list_page(Some("b/"), 10, Some("b/1.car")).await.unwrap();
        assert_eq!(keys(&page), vec!["b/2.car"]);
    }

    #[tokio::test]
    async fn test_localfs_missing_base_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().join("absent"));
        let page = store.list_page(None, 10, None).await.unwrap();
        assert!(page.objects.is_empty());
        assert!(page.next_token.is_none());
    }
}
