//! Concatenate shards into one manifest
//!
//! Shards are ordered by their numeric index, never by directory order,
//! and copied byte for byte. The manifest appears under its final name
//! only once every shard has been copied and the file synced.

use crate::diff::shard::list_shards;
use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub manifest: PathBuf,
    pub shards: usize,
    pub bytes: u64,
    /// Indices missing between the first and last shard
    pub gaps: Vec<u64>,
}

/// Concatenate every shard in `shard_dir` into `manifest_path`
pub async fn merge(shard_dir: &Path, manifest_path: &Path) -> IoResult<MergeSummary> {
    let shards = list_shards(shard_dir).await?;

    let mut gaps = Vec::new();
    let mut expected = shards.first().map(|(index, _)| *index).unwrap_or(0);
    for (index, _) in &shards {
        gaps.extend(expected..*index);
        expected = index + 1;
    }
    if !gaps.is_empty() {
        warn!(?gaps, dir = %shard_dir.display(), "shard indices are not contiguous");
    }

    if let Some(parent) = manifest_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut temp_name = manifest_path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut writer = BufWriter::new(tokio::fs::File::create(&temp_path).await?);
    let mut bytes = 0u64;
    for (_, path) in &shards {
        let mut shard = tokio::fs::File::open(path).await?;
        bytes += tokio::io::copy(&mut shard, &mut writer).await?;
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    drop(writer);
    tokio::fs::rename(&temp_path, manifest_path).await?;

    info!(
        shards = shards.len(),
        bytes,
        manifest = %manifest_path.display(),
        "manifest merged"
    );

    Ok(MergeSummary {
        manifest: manifest_path.to_path_buf(),
        shards: shards.len(),
        bytes,
        gaps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nine_before_ten() {
        let dir = tempfile::tempdir().unwrap();
        let shards = dir.path().join("shards");
        tokio::fs::create_dir_all(&shards).await.unwrap();
        for index in 0..=10u64 {
            tokio::fs::write(shards.join(format!("{}.ndjson", index)), format!("{}\n", index))
                .await
                .unwrap();
        }

        let manifest = dir.path().join("out.ndjson");
        let summary = merge(&shards, &manifest).await.unwrap();

        let text = tokio::fs::read_to_string(&manifest).await.unwrap();
        let order: Vec<&str> = text.lines().collect();
        assert_eq!(
            order,
            vec!["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]
        );
        assert_eq!(summary.shards, 11);
        assert_eq!(summary.bytes, text.len() as u64);
        assert!(summary.gaps.is_empty());
    }

    #[tokio::test]
    async fn test_ignores_temp_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("0.ndjson"), b"a\n").await.unwrap();
        tokio::fs::write(dir.path().join("1.ndjson.tmp"), b"partial").await.unwrap();
        tokio::fs::write(dir.path().join("README"), b"x").await.unwrap();

        let manifest = dir.path().join("manifest.ndjson");
        let summary = merge(dir.path(), &manifest).await.unwrap();
        assert_eq!(summary.shards, 1);
        assert_eq!(tokio::fs::read(&manifest).await.unwrap(), b"a\n");
    }

    #[tokio::test]
    async fn test_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let shards = dir.path().join("s");
        tokio::fs::create_dir_all(&shards).await.unwrap();
        for index in [0, 1, 4] {
            tokio::fs::write(shards.join(format!("{}.ndjson", index)), b"x\n")
                .await
                .unwrap();
        }

        let summary = merge(&shards, &dir.path().join("m.ndjson")).await.unwrap();
        assert_eq!(summary.gaps, vec![2, 3]);
        assert_eq!(summary.shards, 3);
    }

    #[tokio::test]
    async fn test_no_shards_gives_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("empty.ndjson");
        let summary = merge(&dir.path().join("none"), &manifest).await.unwrap();
        assert_eq!(summary.shards, 0);
        assert_eq!(tokio::fs::read(&manifest).await.unwrap().len(), 0);
    }
}
