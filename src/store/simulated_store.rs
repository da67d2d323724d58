//! Simulated Object Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults from a seeded RNG, so a
//! failing seed replays the exact same fault sequence.

use crate::store::object_store::{GetResponse, ListPage, ObjectStore, StoreFuture};
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of LIST operation failure
    pub list_fail_prob: f64,
    /// Probability of HAS (head) failure
    pub has_fail_prob: f64,
    /// Probability of GET failure
    pub get_fail_prob: f64,
    /// Probability of PUT failure
    pub put_fail_prob: f64,
    /// Probability of operation timeout
    pub timeout_prob: f64,
    /// Probability a successful LIST returns fewer keys than asked for.
    /// The token still points at the last key returned.
    pub short_page_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            list_fail_prob: 0.05,       // 5%
            has_fail_prob: 0.01,        // 1%
            get_fail_prob: 0.01,        // 1%
            put_fail_prob: 0.01,        // 1%
            timeout_prob: 0.01,         // 1%
            short_page_prob: 0.10,      // 10%
            latency_range_us: (0, 200), // up to 0.2ms
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            list_fail_prob: 0.25,
            has_fail_prob: 0.10,
            get_fail_prob: 0.10,
            put_fail_prob: 0.10,
            timeout_prob: 0.05,
            short_page_prob: 0.30,
            latency_range_us: (0, 500),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            list_fail_prob: 0.0,
            has_fail_prob: 0.0,
            get_fail_prob: 0.0,
            put_fail_prob: 0.0,
            timeout_prob: 0.0,
            short_page_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub list_attempts: u64,
    pub list_failures: u64,
    pub has_attempts: u64,
    pub has_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub put_attempts: u64,
    pub put_failures: u64,
    pub timeouts: u64,
    pub short_pages: u64,
}

#[derive(Clone, Copy)]
enum Op {
    List,
    Has,
    Get,
    Put,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
}

/// Simulated object store that wraps another store and injects faults
#[derive(Clone)]
pub struct SimulatedObjectStore<S> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore> SimulatedObjectStore<S> {
    /// Create a new simulated store driven by `seed`
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Roll the dice for one operation.
    ///
    /// Returns the injected error (if any) and the latency to simulate.
    /// All RNG draws happen here, under one lock, so the draw order is
    /// fixed per operation.
    fn roll(&self, op: Op) -> (Option<IoError>, u64) {
        let mut s = self.state.lock();
        let (fail_prob, name) = match op {
            Op::List => {
                s.stats.list_attempts += 1;
                (self.config.list_fail_prob, "list")
            }
            Op::Has => {
                s.stats.has_attempts += 1;
                (self.config.has_fail_prob, "has")
            }
            Op::Get => {
                s.stats.get_attempts += 1;
                (self.config.get_fail_prob, "get")
            }
            Op::Put => {
                s.stats.put_attempts += 1;
                (self.config.put_fail_prob, "put")
            }
        };

        let timeout = s.rng.gen_bool(self.config.timeout_prob.clamp(0.0, 1.0));
        let fail = s.rng.gen_bool(fail_prob.clamp(0.0, 1.0));
        let (min, max) = self.config.latency_range_us;
        let latency_us = if max > min {
            s.rng.gen_range(min..max)
        } else {
            min
        };

        let error = if timeout {
            s.stats.timeouts += 1;
            Some(IoError::new(ErrorKind::TimedOut, "simulated timeout"))
        } else if fail {
            match op {
                Op::List => s.stats.list_failures += 1,
                Op::Has => s.stats.has_failures += 1,
                Op::Get => s.stats.get_failures += 1,
                Op::Put => s.stats.put_failures += 1,
            }
            Some(IoError::new(
                ErrorKind::Other,
                format!("simulated {} failure", name),
            ))
        } else {
            None
        };
        (error, latency_us)
    }

    /// How many of `len` listed keys to return, if this page is cut short
    fn roll_short_page(&self, len: usize) -> Option<usize> {
        let mut s = self.state.lock();
        let short = s.rng.gen_bool(self.config.short_page_prob.clamp(0.0, 1.0));
        if !short || len < 2 {
            return None;
        }
        s.stats.short_pages += 1;
        Some(s.rng.gen_range(1..len))
    }
}

async fn simulate_latency(latency_us: u64) {
    if latency_us > 0 {
        tokio::time::sleep(std::time::Duration::from_micros(latency_us)).await;
    }
}

impl<S: ObjectStore> ObjectStore for SimulatedObjectStore<S> {
    fn list_page<'a>(
        &'a self,
        prefix: Option<&'a str>,
        max_keys: usize,
        continuation_token: Option<&'a str>,
    ) -> StoreFuture<'a, ListPage> {
        Box::pin(async move {
            let (error, latency_us) = self.roll(Op::List);
            simulate_latency(latency_us).await;
            if let Some(e) = error {
                return Err(e);
            }
            let mut page = self
                .inner_store
                .list_page(prefix, max_keys, continuation_token)
                .await?;
            if let Some(keep) = self.roll_short_page(page.objects.len()) {
                page.objects.truncate(keep);
                page.next_token = page.objects.last().map(|o| o.key.clone());
            }
            Ok(page)
        })
    }

    fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let (error, latency_us) = self.roll(Op::Has);
            simulate_latency(latency_us).await;
            if let Some(e) = error {
                return Err(e);
            }
            self.inner_store.has(key).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<GetResponse>> {
        Box::pin(async move {
            let (error, latency_us) = self.roll(Op::Get);
            simulate_latency(latency_us).await;
            if let Some(e) = error {
                return Err(e);
            }
            self.inner_store.get(key).await
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let (error, latency_us) = self.roll(Op::Put);
            simulate_latency(latency_us).await;
            if let Some(e) = error {
                return Err(e);
            }
            self.inner_store.put(key, data).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::object_store::InMemoryObjectStore;

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let inner = InMemoryObjectStore::new();
        inner.insert("raw/a.car", "abc");
        let store = SimulatedObjectStore::new(inner, 7, SimulatedStoreConfig::no_faults());

        for _ in 0..50 {
            let page = store.list_page(None, 10, None).await.unwrap();
            assert_eq!(page.objects.len(), 1);
        }
        let stats = store.stats();
        assert_eq!(stats.list_attempts, 50);
        assert_eq!(stats.list_failures, 0);
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        async fn outcomes(seed: u64) -> Vec<bool> {
            let store = SimulatedObjectStore::new(
                InMemoryObjectStore::new(),
                seed,
                SimulatedStoreConfig::high_chaos(),
            );
            let mut out = Vec::new();
            for _ in 0..100 {
                out.push(store.has("k").await.is_ok());
            }
            out
        }

        assert_eq!(outcomes(42).await, outcomes(42).await);
    }

    #[tokio::test]
    async fn test_chaos_injects_failures() {
        let mut config = SimulatedStoreConfig::no_faults();
        config.list_fail_prob = 1.0;
        let store = SimulatedObjectStore::new(InMemoryObjectStore::new(), 1, config);

        let err = store.list_page(None, 10, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(store.stats().list_failures, 1);

        store.reset_stats();
        assert_eq!(store.stats().list_attempts, 0);
    }

    #[tokio::test]
    async fn test_short_pages_keep_listing_complete() {
        let inner = InMemoryObjectStore::new();
        for i in 0..40 {
            inner.insert(format!("raw/{:02}.car", i), "x");
        }
        let mut config = SimulatedStoreConfig::no_faults();
        config.short_page_prob = 1.0;
        let store = SimulatedObjectStore::new(inner, 11, config);

        let mut listed = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = store.list_page(None, 8, token.as_deref()).await.unwrap();
            assert!(!page.objects.is_empty());
            assert!(page.objects.len() <= 8);
            listed.extend(page.objects.into_iter().map(|o| o.key));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        let expected: Vec<String> = (0..40).map(|i| format!("raw/{:02}.car", i)).collect();
        assert_eq!(listed, expected);
        assert!(store.stats().short_pages > 0);
    }
}
