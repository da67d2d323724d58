//! Bounded retries for object store operations
//!
//! `RetryingObjectStore` wraps any `ObjectStore` and re-issues failed
//! operations according to an injected `RetryPolicy`. The diff pipeline
//! never retries on its own; this wrapper is the only retry layer.

use crate::store::object_store::{GetResponse, ListPage, ObjectStore, StoreFuture};
use std::fmt;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default attempts per operation (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// TigerStyle: Explicit limits with _MAX suffix
const MAX_ATTEMPTS_MAX: u32 = 20;
const BACKOFF_DELAY_MAX: Duration = Duration::from_secs(30);

/// Predicate deciding whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&IoError) -> bool + Send + Sync>;

/// Retry policy for store operations
///
/// Attempt `n` (1-based) that fails with a retryable error sleeps
/// `base_delay * 2^(n-1)` (capped) before attempt `n + 1`.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// Create a policy with the default retryable predicate
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_MAX),
            base_delay,
            retryable: Arc::new(is_transient),
        }
    }

    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    /// Replace the retryable-error predicate
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&IoError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(BACKOFF_DELAY_MAX)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> IoResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IoResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && (self.retryable)(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "store operation failed, retrying in {:?}",
                        delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Errors that describe the request rather than the transport are final.
pub fn is_transient(err: &IoError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::Unsupported
    )
}

/// Object store wrapper that applies a `RetryPolicy` to every operation
#[derive(Debug, Clone)]
pub struct RetryingObjectStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingObjectStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        RetryingObjectStore { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<S: ObjectStore> ObjectStore for RetryingObjectStore<S> {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(self.policy.run("list", move || {
            self.inner.list_page(prefix, max_keys, continuation_token)
        }))
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.policy.run("has", move || self.inner.has(key)))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        Box::pin(self.policy.run("get", move || self.inner.get(key)))
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(self.policy.run("put", move || self.inner.put(key, data)))
    }
}
