//! Numbered NDJSON shards
//!
//! Each batch becomes `{index}.ndjson` in the output directory. A shard is
//! written to `{index}.ndjson.tmp`, flushed, synced and only then renamed
//! into place, so a visible shard is always complete.

use crate::diff::stream::{Batch, DiffEntry};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

pub const SHARD_EXTENSION: &str = "ndjson";
const TEMP_SUFFIX: &str = ".tmp";

/// `{index}.ndjson`
pub fn shard_file_name(index: u64) -> String {
    format!("{}.{}", index, SHARD_EXTENSION)
}

/// Shard index encoded in a file name, if it is a shard
pub fn parse_shard_index(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(SHARD_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Every shard in `dir`, ordered by numeric index
pub async fn list_shards(dir: &Path) -> IoResult<Vec<(u64, PathBuf)>> {
    let mut shards = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(shards),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(index) = name.to_str().and_then(parse_shard_index) {
            shards.push((index, entry.path()));
        }
    }
    shards.sort_by_key(|(index, _)| *index);
    Ok(shards)
}

/// Write one shard durably and return its final path
pub async fn write_shard(dir: &Path, index: u64, entries: &[DiffEntry]) -> IoResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let final_path = dir.join(shard_file_name(index));
    let temp_path = dir.join(format!("{}{}", shard_file_name(index), TEMP_SUFFIX));

    let file = tokio::fs::File::create(&temp_path).await?;
    let mut writer = BufWriter::new(file);
    let mut line = Vec::with_capacity(256);
    for entry in entries {
        line.clear();
        serde_json::to_writer(&mut line, entry)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        writer.write_all(&line).await?;
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    drop(writer);

    tokio::fs::rename(&temp_path, &final_path).await?;
    Ok(final_path)
}

/// Sequential shard writer for one run
#[derive(Debug)]
pub struct ShardWriter {
    dir: PathBuf,
    next_index: u64,
    first_index: u64,
}

impl ShardWriter {
    /// Open `dir` for writing.
    ///
    /// A fresh run requires a directory without shards. A resumed run
    /// continues numbering after the highest existing shard.
    pub async fn open(dir: impl Into<PathBuf>, resume: bool) -> IoResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let existing = list_shards(&dir).await?;
        let next_index = match existing.last() {
            None => 0,
            Some((highest, _)) if resume => highest + 1,
            Some(_) => {
                return Err(IoError::new(
                    ErrorKind::AlreadyExists,
                    format!(
                        "{} already holds {} shard(s); set RESUME=true to continue numbering",
                        dir.display(),
                        existing.len()
                    ),
                ))
            }
        };

        Ok(ShardWriter {
            dir,
            next_index,
            first_index: next_index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index the next batch will be written under
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Highest shard index written, counting shards from earlier runs
    pub fn last_completed(&self) -> Option<u64> {
        self.next_index.checked_sub(1)
    }

    /// Shards written by this writer
    pub fn written(&self) -> u64 {
        self.next_index - self.first_index
    }

    /// Persist `batch` as the next shard
    pub async fn write(&mut self, batch: &Batch) -> IoResult<PathBuf> {
        let index = self.next_index;
        let path = write_shard(&self.dir, index, &batch.entries).await?;
        self.next_index += 1;
        info!(
            shard = index,
            entries = batch.len(),
            resume_cursor = %batch.resume_cursor,
            "shard written"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::stream::ResumeCursor;

    fn entry(n: u32) -> DiffEntry {
        DiffEntry {
            source_key: format!("raw/{}.car", n),
            derived_key: format!("b{}/b{}.car", n, n),
            size: n as u64,
        }
    }

    fn batch(range: std::ops::Range<u32>) -> Batch {
        Batch {
            entries: range.map(entry).collect(),
            resume_cursor: ResumeCursor::FromStart,
        }
    }

    #[test]
    fn test_parse_shard_index() {
        assert_eq!(parse_shard_index("0.ndjson"), Some(0));
        assert_eq!(parse_shard_index("10.ndjson"), Some(10));
        assert_eq!(parse_shard_index("10.ndjson.tmp"), None);
        assert_eq!(parse_shard_index("+1.ndjson"), None);
        assert_eq!(parse_shard_index(".ndjson"), None);
        assert_eq!(parse_shard_index("manifest.ndjson"), None);
    }

    #[tokio::test]
    async fn test_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/shards");
        let path = write_shard(&out, 3, &[entry(1), entry(2)]).await.unwrap();

        assert_eq!(path, out.join("3.ndjson"));
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: DiffEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, entry(1));
        assert!(!out.join("3.ndjson.tmp").exists());
    }

    #[tokio::test]
    async fn test_writer_numbers_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::open(dir.path(), false).await.unwrap();
        assert_eq!(writer.last_completed(), None);

        writer.write(&batch(0..2)).await.unwrap();
        writer.write(&batch(2..4)).await.unwrap();

        let shards = list_shards(dir.path()).await.unwrap();
        let indices: Vec<u64> = shards.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(writer.last_completed(), Some(1));
        assert_eq!(writer.written(), 2);
    }

    #[tokio::test]
    async fn test_fresh_run_refuses_existing_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 0, &[entry(0)]).await.unwrap();

        let err = ShardWriter::open(dir.path(), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let resumed = ShardWriter::open(dir.path(), true).await.unwrap();
        assert_eq!(resumed.next_index(), 1);
        assert_eq!(resumed.written(), 0);
    }

    #[tokio::test]
    async fn test_list_shards_orders_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10, 9, 2, 1] {
            write_shard(dir.path(), index, &[entry(index as u32)])
                .await
                .unwrap();
        }
        tokio::fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();

        let indices: Vec<u64> = list_shards(dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![1, 2, 9, 10]);
    }

    #[tokio::test]
    async fn test_list_shards_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_shards(&dir.path().join("absent")).await.unwrap().is_empty());
    }
}
