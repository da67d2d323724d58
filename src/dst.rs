//! Deterministic Simulation Testing for the create-list pipeline
//!
//! Seeds a bucket with a random mix of keys, runs the pipeline against a
//! fault-injecting view of it, and restarts from the reported resume
//! cursor after every failure until a run completes. Invariants:
//!
//! - a failed run reports the highest shard index actually on disk
//! - every shard but the last holds exactly `write_batch_size` entries
//! - the manifest, with repeated derived keys removed, equals the expected
//!   derived keys in listing order
//!
//! ```text
//! for seed in 0..10000 {
//!     let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::chaos(seed));
//!     harness.run().await;
//!     assert!(harness.result().is_success(), "seed {}", seed);
//! }
//! ```

use crate::diff::key_deriver::{derive_destination_key, raw_source_key};
use crate::diff::{list_shards, DedupScope, DiffEntry, ResumeCursor};
use crate::pipeline::{PipelineConfig, PipelineRunner};
use crate::store::{
    InMemoryObjectStore, ObjectStore, RetryPolicy, RetryingObjectStore, SimulatedObjectStore,
    SimulatedStoreConfig, SimulatedStoreStats,
};
use ahash::AHashSet;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// TigerStyle: Explicit limits with _MAX suffix
const RESTARTS_MAX: u32 = 200;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for pipeline DST
#[derive(Debug, Clone)]
pub struct PipelineDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Fault injection on the origin bucket
    pub store_config: SimulatedStoreConfig,
    /// Objects seeded into the bucket
    pub object_count: usize,
    pub read_batch_size: usize,
    pub write_batch_size: usize,
    /// Attempts per store operation before the run fails
    pub retry_attempts: u32,
    /// Probability a CAR is stored a second time under another directory
    pub duplicate_probability: f64,
    /// Probability of a key outside the `raw/` namespace
    pub foreign_probability: f64,
}

impl Default for PipelineDSTConfig {
    fn default() -> Self {
        PipelineDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig::default(),
            object_count: 120,
            read_batch_size: 7,
            write_batch_size: 5,
            retry_attempts: 3,
            duplicate_probability: 0.15,
            foreign_probability: 0.15,
        }
    }
}

impl PipelineDSTConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no fault injection
    pub fn calm(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::default(),
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection, fewer retries
    pub fn chaos(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::high_chaos(),
            retry_attempts: 2,
            ..Default::default()
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone, Default)]
pub struct PipelineDSTResult {
    /// Seed used
    pub seed: u64,
    /// Pipeline invocations, the first run included
    pub attempts: u32,
    /// Invocations that ended in an error
    pub failed_runs: u32,
    /// Rows in the final manifest
    pub manifest_rows: usize,
    /// Rows repeated because a restart re-listed pages
    pub duplicate_rows: usize,
    /// Shards on disk at the end
    pub shards: usize,
    /// Store fault statistics
    pub store_stats: SimulatedStoreStats,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
}

impl PipelineDSTResult {
    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} attempts ({} failed), {} rows ({} repeated), {} shards, {} violations",
            self.seed,
            self.attempts,
            self.failed_runs,
            self.manifest_rows,
            self.duplicate_rows,
            self.shards,
            self.invariant_violations.len()
        )
    }
}

type DSTStore = SimulatedObjectStore<InMemoryObjectStore>;

/// DST harness for the create-list pipeline
pub struct PipelineDSTHarness {
    config: PipelineDSTConfig,
    store: Arc<DSTStore>,
    expected: Vec<String>,
    work_dir: PathBuf,
    result: PipelineDSTResult,
}

impl PipelineDSTHarness {
    pub fn new(config: PipelineDSTConfig) -> Self {
        let inner = InMemoryObjectStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        seed_bucket(&inner, &mut rng, &config);
        let expected = expected_derived_keys(&inner);

        let store = Arc::new(SimulatedObjectStore::new(
            inner,
            config.seed.wrapping_add(1), // Different seed for store
            config.store_config.clone(),
        ));
        let work_dir = std::env::temp_dir().join(format!(
            "carpark-dst-{}-{}-{}",
            std::process::id(),
            config.seed,
            RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = PipelineDSTResult {
            seed: config.seed,
            ..Default::default()
        };

        PipelineDSTHarness {
            config,
            store,
            expected,
            work_dir,
            result,
        }
    }

    /// Derived keys a clean run emits, in listing order
    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    fn pipeline_config(&self, start_cursor: Option<String>, restarted: bool) -> PipelineConfig {
        PipelineConfig {
            read_batch_size: self.config.read_batch_size,
            write_batch_size: self.config.write_batch_size,
            start_cursor,
            dedup_scope: DedupScope::Run,
            drain_final_batch: true,
            continue_numbering: restarted,
            ..PipelineConfig::new(self.work_dir.join("shards"), self.work_dir.join("list.ndjson"))
        }
    }

    /// Run until a pipeline invocation succeeds, then check invariants
    pub async fn run(&mut self) {
        let policy = RetryPolicy::new(self.config.retry_attempts, Duration::ZERO);
        let origin: Arc<dyn ObjectStore> =
            Arc::new(RetryingObjectStore::new(Arc::clone(&self.store), policy));

        let mut start_cursor = None;
        let mut restarted = false;
        loop {
            if self.result.attempts >= RESTARTS_MAX {
                self.violation(format!("no successful run after {} attempts", RESTARTS_MAX));
                break;
            }
            self.result.attempts += 1;

            let runner = PipelineRunner::new(
                self.pipeline_config(start_cursor.clone(), restarted),
                Arc::clone(&origin),
            );
            match runner.run(None).await {
                Ok(report) => {
                    if report.listed.resume_cursor != ResumeCursor::Complete {
                        self.violation(format!(
                            "successful run ended at cursor {}",
                            report.listed.resume_cursor
                        ));
                    }
                    break;
                }
                Err(err) => {
                    self.result.failed_runs += 1;
                    match runner.last_shard_on_disk().await {
                        Ok(on_disk) if on_disk != err.last_completed_shard => {
                            self.violation(format!(
                                "error reported last shard {:?}, disk has {:?}",
                                err.last_completed_shard, on_disk
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => self.violation(format!("cannot list shards: {}", e)),
                    }
                    start_cursor = err.resume_cursor.token().map(str::to_string);
                    restarted = true;
                }
            }
        }

        self.check_invariants().await;
        self.result.store_stats = self.store.stats();
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }

    async fn check_invariants(&mut self) {
        // Invariant 1: shards are full except the last
        match list_shards(&self.work_dir.join("shards")).await {
            Ok(shards) => {
                self.result.shards = shards.len();
                let last = shards.len().saturating_sub(1);
                for (position, (index, path)) in shards.iter().enumerate() {
                    let lines = match tokio::fs::read_to_string(path).await {
                        Ok(text) => text.lines().count(),
                        Err(e) => {
                            self.violation(format!("shard {} unreadable: {}", index, e));
                            continue;
                        }
                    };
                    let full = lines == self.config.write_batch_size;
                    let short_tail = position == last && lines > 0 && lines <= self.config.write_batch_size;
                    if !full && !short_tail {
                        self.violation(format!("shard {} holds {} entries", index, lines));
                    }
                }
            }
            Err(e) => self.violation(format!("cannot list shards: {}", e)),
        }

        // Invariant 2: first occurrences in the manifest match the expected order
        let manifest = match read_manifest(&self.work_dir.join("list.ndjson")).await {
            Ok(rows) => rows,
            Err(e) => {
                self.violation(format!("manifest unreadable: {}", e));
                return;
            }
        };
        self.result.manifest_rows = manifest.len();

        let mut seen = AHashSet::new();
        let mut first_seen = Vec::with_capacity(manifest.len());
        for entry in &manifest {
            if seen.insert(entry.derived_key.clone()) {
                first_seen.push(entry.derived_key.clone());
            }
        }
        self.result.duplicate_rows = manifest.len() - first_seen.len();
        if first_seen != self.expected {
            self.violation(format!(
                "manifest has {} distinct keys in some order, expected {}",
                first_seen.len(),
                self.expected.len()
            ));
        }

        // Invariant 3: repeats only come from restarts
        if self.result.failed_runs == 0 && self.result.duplicate_rows > 0 {
            self.violation(format!(
                "{} repeated rows without a restart",
                self.result.duplicate_rows
            ));
        }
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    /// Get the result
    pub fn result(&self) -> &PipelineDSTResult {
        &self.result
    }

    /// Consume and return the result
    pub fn into_result(self) -> PipelineDSTResult {
        self.result
    }
}

/// Populate `store` with CARs, duplicates, foreign namespaces and non-CAR files
fn seed_bucket(store: &InMemoryObjectStore, rng: &mut ChaCha8Rng, config: &PipelineDSTConfig) {
    let mut placed = BTreeSet::new();
    while placed.len() < config.object_count {
        let digest: [u8; 32] = rng.gen();
        let user = rng.gen_range(0..5u32);
        let roll: f64 = rng.gen();

        let key = if roll < config.foreign_probability {
            match rng.gen_range(0..3u32) {
                0 => format!("complete/{}", raw_source_key("", &digest).trim_start_matches('/')),
                1 => format!("other/{}.car", user),
                _ => format!("raw/root/{}/notes-{}.txt", user, rng.gen::<u16>()),
            }
        } else {
            raw_source_key(&format!("raw/root/{}", user), &digest)
        };
        if placed.insert(key.clone()) {
            store.insert(key, vec![0u8; rng.gen_range(0..64)]);
        }

        if roll >= config.foreign_probability && rng.gen_bool(config.duplicate_probability) {
            let copy = raw_source_key(&format!("raw/copy/{}", user + 10), &digest);
            if placed.insert(copy.clone()) {
                store.insert(copy, vec![1u8; 8]);
            }
        }
    }
}

/// Derived keys in listing order, first occurrence only
fn expected_derived_keys(store: &InMemoryObjectStore) -> Vec<String> {
    let mut seen = AHashSet::new();
    let mut expected = Vec::new();
    for key in store.keys() {
        if !key.ends_with(".car") {
            continue;
        }
        if let Ok(derived) = derive_destination_key(&key) {
            if seen.insert(derived.clone()) {
                expected.push(derived);
            }
        }
    }
    expected
}

async fn read_manifest(path: &Path) -> std::io::Result<Vec<DiffEntry>> {
    let text = tokio::fs::read_to_string(path).await?;
    text.lines()
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .collect()
}

/// Run a batch of DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> PipelineDSTConfig,
) -> Vec<PipelineDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = PipelineDSTHarness::new(config_fn(seed));
        harness.run().await;
        results.push(harness.into_result());
    }
    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[PipelineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();
    let total_attempts: u32 = results.iter().map(|r| r.attempts).sum();
    let total_failed: u32 = results.iter().map(|r| r.failed_runs).sum();
    let total_repeats: usize = results.iter().map(|r| r.duplicate_rows).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} runs ({} failed and resumed), {} repeated rows",
        passed, total, total_attempts, total_failed, total_repeats
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
