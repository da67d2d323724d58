//! Update-list: which manifest entries the destination still lacks
//!
//! Streams a manifest line by line, asks the destination bucket whether
//! each derived key exists, and writes the missing entries to a new NDJSON
//! file. The destination is only ever read.

use crate::diff::DiffEntry;
use crate::metrics::PipelineMetrics;
use crate::store::ObjectStore;
use futures::StreamExt;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

// TigerStyle: Explicit limits with _MAX suffix
const LINE_LENGTH_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub checked: u64,
    pub present: u64,
    pub missing: u64,
    pub output: PathBuf,
}

pub struct UpdateListRunner {
    destination: Arc<dyn ObjectStore>,
    metrics: Arc<PipelineMetrics>,
}

impl UpdateListRunner {
    pub fn new(destination: Arc<dyn ObjectStore>) -> Self {
        UpdateListRunner {
            destination,
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check every entry of `manifest` and write the missing ones to `output`
    pub async fn run(&self, manifest: &Path, output: &Path) -> IoResult<UpdateReport> {
        let file = tokio::fs::File::open(manifest).await?;
        let mut lines = FramedRead::new(file, LinesCodec::new_with_max_length(LINE_LENGTH_MAX));

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut temp_name = output.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        let mut writer = BufWriter::new(tokio::fs::File::create(&temp_path).await?);

        let mut report = UpdateReport {
            output: output.to_path_buf(),
            ..UpdateReport::default()
        };
        let mut line_no = 0u64;
        while let Some(line) = lines.next().await {
            line_no += 1;
            let line = line.map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DiffEntry = serde_json::from_str(&line).map_err(|e| {
                IoError::new(
                    ErrorKind::InvalidData,
                    format!("{}:{}: {}", manifest.display(), line_no, e),
                )
            })?;

            report.checked += 1;
            let exists = self.destination.has(&entry.derived_key).await?;
            self.metrics.record_check(!exists);
            if exists {
                report.present += 1;
                continue;
            }

            debug!(key = %entry.derived_key, "missing from destination");
            report.missing += 1;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);
        tokio::fs::rename(&temp_path, output).await?;

        info!(
            checked = report.checked,
            missing = report.missing,
            output = %output.display(),
            "update list written"
        );
        Ok(report)
    }
}
