//! Create-list pipeline
//!
//! Phase 1 streams the listing through the diff into shards. Phase 2 only
//! starts once every shard is durable: it merges them into the manifest
//! and publishes it.
//!
//! ```text
//! Phase 1: list ─► derive ─► dedup ─► batch ─► shard   (one page at a time)
//! Phase 2: merge shards ─► manifest ─► publish
//! ```

use crate::config::CreateListConfig;
use crate::diff::{
    list_shards, merge, DedupScope, DeriveError, DiffStats, DiffStream, DiffStreamError,
    MergeSummary, PaginatedLister, ResumeCursor, ShardWriter,
};
use crate::metrics::PipelineMetrics;
use crate::publish::{PublishError, Publisher};
use crate::store::ObjectStore;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Settings for one run, owned by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub prefix: Option<String>,
    pub read_batch_size: usize,
    pub write_batch_size: usize,
    /// Resume the listing after this token
    pub start_cursor: Option<String>,
    pub shard_dir: PathBuf,
    pub manifest_path: PathBuf,
    /// Display name passed to the publisher
    pub manifest_name: String,
    pub dedup_scope: DedupScope,
    pub drain_final_batch: bool,
    /// Continue shard numbering in a directory that already holds shards.
    /// Implied by `start_cursor`.
    pub continue_numbering: bool,
}

impl PipelineConfig {
    pub fn new(shard_dir: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        let manifest_name = manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest.ndjson".to_string());
        PipelineConfig {
            prefix: None,
            read_batch_size: 1000,
            write_batch_size: 1000,
            start_cursor: None,
            shard_dir: shard_dir.into(),
            manifest_path,
            manifest_name,
            dedup_scope: DedupScope::Run,
            drain_final_batch: true,
            continue_numbering: false,
        }
    }

    pub fn from_create_list(config: &CreateListConfig) -> Self {
        PipelineConfig {
            prefix: config.prefix.clone(),
            read_batch_size: config.read_batch_size,
            write_batch_size: config.write_batch_size,
            start_cursor: config.continuation_token.clone(),
            dedup_scope: config.dedup_scope,
            drain_final_batch: config.drain_final_batch,
            continue_numbering: config.resume,
            ..PipelineConfig::new(config.shard_dir(), config.manifest_path())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineErrorKind {
    #[error("listing failed: {0}")]
    Listing(std::io::Error),
    #[error(transparent)]
    MalformedSourceKey(DeriveError),
    #[error("shard or manifest I/O failed: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Publish(PublishError),
}

impl From<DiffStreamError> for PipelineErrorKind {
    fn from(err: DiffStreamError) -> Self {
        match err {
            DiffStreamError::Store(e) => PipelineErrorKind::Listing(e),
            DiffStreamError::Derive(e) => PipelineErrorKind::MalformedSourceKey(e),
        }
    }
}

/// A fatal error with enough context to resume
#[derive(Debug)]
pub struct PipelineError {
    pub kind: PipelineErrorKind,
    /// Highest shard index known to be durable
    pub last_completed_shard: Option<u64>,
    /// Cursor a re-run should start from
    pub resume_cursor: ResumeCursor,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (last completed shard: ", self.kind)?;
        match self.last_completed_shard {
            Some(index) => write!(f, "{}", index)?,
            None => write!(f, "none")?,
        }
        write!(f, ", resume cursor: {})", self.resume_cursor)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Outcome of phase 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReport {
    pub shards_written: u64,
    pub last_completed_shard: Option<u64>,
    pub stats: DiffStats,
    /// Entries left in the buffer when the final batch is not drained
    pub unflushed: usize,
    pub resume_cursor: ResumeCursor,
}

/// Outcome of a full run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub listed: ListReport,
    pub merged: MergeSummary,
    /// Content identifier, when a publisher was given
    pub cid: Option<String>,
}

pub struct PipelineRunner {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        PipelineRunner {
            config,
            store,
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Phase 1: list, diff and write shards
    pub async fn list_and_shard(&self) -> Result<ListReport, PipelineError> {
        let config = &self.config;
        let lister = PaginatedLister::new(
            Arc::clone(&self.store),
            config.prefix.clone(),
            config.read_batch_size,
            config.start_cursor.clone(),
        );
        let metrics = Arc::clone(&self.metrics);
        let mut stream = DiffStream::new(lister, config.write_batch_size, config.dedup_scope)
            .on_page(move |stats| metrics.observe_diff(stats));
        let mut durable_cursor = stream.resume_cursor();

        info!(
            prefix = ?config.prefix,
            start_cursor = ?config.start_cursor,
            shard_dir = %config.shard_dir.display(),
            "listing started"
        );

        let resume = config.continue_numbering || config.start_cursor.is_some();
        let mut writer = match ShardWriter::open(&config.shard_dir, resume).await {
            Ok(writer) => writer,
            Err(e) => {
                return Err(PipelineError {
                    kind: PipelineErrorKind::Io(e),
                    last_completed_shard: self.last_shard_on_disk().await.ok().flatten(),
                    resume_cursor: durable_cursor,
                })
            }
        };

        loop {
            let batch = match stream.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    return Err(PipelineError {
                        kind: e.into(),
                        last_completed_shard: writer.last_completed(),
                        resume_cursor: durable_cursor,
                    })
                }
            };
            self.write_batch(&mut writer, &batch, &durable_cursor).await?;
            durable_cursor = batch.resume_cursor;
        }

        let mut unflushed = stream.pending_len();
        if config.drain_final_batch {
            if let Some(batch) = stream.drain() {
                self.write_batch(&mut writer, &batch, &durable_cursor).await?;
                durable_cursor = batch.resume_cursor;
                unflushed = 0;
            }
        } else if unflushed > 0 {
            warn!(
                entries = unflushed,
                "final partial batch left unflushed; rerun with DRAIN_FINAL_BATCH=true to keep it"
            );
        }
        self.metrics.observe_diff(stream.stats());

        let stats = stream.stats().clone();
        info!(
            shards = writer.written(),
            entries = stats.emitted,
            rejected = stats.rejected,
            duplicates = stats.duplicates,
            "listing complete"
        );

        Ok(ListReport {
            shards_written: writer.written(),
            last_completed_shard: writer.last_completed(),
            stats,
            unflushed,
            resume_cursor: durable_cursor,
        })
    }

    async fn write_batch(
        &self,
        writer: &mut ShardWriter,
        batch: &crate::diff::Batch,
        durable_cursor: &ResumeCursor,
    ) -> Result<(), PipelineError> {
        writer.write(batch).await.map_err(|e| PipelineError {
            kind: PipelineErrorKind::Io(e),
            last_completed_shard: writer.last_completed(),
            resume_cursor: durable_cursor.clone(),
        })?;
        self.metrics.record_shard();
        Ok(())
    }

    /// Phase 2: merge shards and publish the manifest
    pub async fn merge_and_publish(
        &self,
        listed: &ListReport,
        publisher: Option<&dyn Publisher>,
    ) -> Result<(MergeSummary, Option<String>), PipelineError> {
        let config = &self.config;
        let fail = |kind| PipelineError {
            kind,
            last_completed_shard: listed.last_completed_shard,
            resume_cursor: listed.resume_cursor.clone(),
        };

        let merged = merge(&config.shard_dir, &config.manifest_path)
            .await
            .map_err(|e| fail(PipelineErrorKind::Io(e)))?;
        self.metrics.record_manifest(merged.bytes);

        let cid = match publisher {
            Some(publisher) => {
                let cid = publisher
                    .publish(&config.manifest_path, &config.manifest_name)
                    .await
                    .map_err(|e| fail(PipelineErrorKind::Publish(e)))?;
                info!(%cid, manifest = %config.manifest_path.display(), "manifest published");
                Some(cid)
            }
            None => None,
        };
        Ok((merged, cid))
    }

    /// Both phases
    pub async fn run(&self, publisher: Option<&dyn Publisher>) -> Result<RunReport, PipelineError> {
        let listed = self.list_and_shard().await?;
        let (merged, cid) = self.merge_and_publish(&listed, publisher).await?;
        Ok(RunReport {
            listed,
            merged,
            cid,
        })
    }

    /// Phase 2 over the shards a previous run left on disk, without
    /// listing. Used to retry a failed merge or publish.
    pub async fn publish_existing(
        &self,
        publisher: Option<&dyn Publisher>,
    ) -> Result<RunReport, PipelineError> {
        let fail = |kind: PipelineErrorKind, last_completed_shard: Option<u64>| PipelineError {
            kind,
            last_completed_shard,
            resume_cursor: ResumeCursor::FromStart,
        };
        let shards = list_shards(&self.config.shard_dir)
            .await
            .map_err(|e| fail(PipelineErrorKind::Io(e), None))?;
        let Some(&(last, _)) = shards.last() else {
            let missing = std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no shards in {}", self.config.shard_dir.display()),
            );
            return Err(fail(PipelineErrorKind::Io(missing), None));
        };

        info!(
            shards = shards.len(),
            shard_dir = %self.config.shard_dir.display(),
            "publishing shards from a previous run"
        );
        let listed = ListReport {
            shards_written: 0,
            last_completed_shard: Some(last),
            stats: DiffStats::default(),
            unflushed: 0,
            resume_cursor: ResumeCursor::Complete,
        };
        let (merged, cid) = self.merge_and_publish(&listed, publisher).await?;
        Ok(RunReport {
            listed,
            merged,
            cid,
        })
    }

    /// Highest shard currently on disk
    pub async fn last_shard_on_disk(&self) -> std::io::Result<Option<u64>> {
        Ok(list_shards(&self.config.shard_dir)
            .await?
            .last()
            .map(|(index, _)| *index))
    }
}
