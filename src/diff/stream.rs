//! Filter, derive, dedup and re-batch listing pages
//!
//! `DiffBuffer` is the pure part: it takes whole pages, keeps `.car`
//! objects, derives their destination keys, drops duplicates and hands
//! out fixed-size batches in listing order. `DiffStream` drives it from a
//! `PaginatedLister`, pulling one page at a time.
//!
//! Every batch carries the cursor a re-run should start from once that
//! batch is durable: the start cursor of the oldest page that still has
//! entries in the buffer, or the cursor after the last fully emitted page.

use crate::diff::cid::ContentId;
use crate::diff::key_deriver::{derive_content_id, destination_key, DeriveError};
use crate::diff::lister::{Page, PaginatedLister};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

const CAR_SUFFIX: &str = ".car";

// TigerStyle: Explicit limits with _MAX suffix
pub const BATCH_SIZE_MAX: usize = 1_000_000;

/// One manifest row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    #[serde(rename = "in")]
    pub source_key: String,
    #[serde(rename = "out")]
    pub derived_key: String,
    pub size: u64,
}

/// Where a re-run should pick the listing back up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCursor {
    /// Nothing durable yet past the run's own start
    FromStart,
    /// Continue listing after this token
    Token(String),
    /// The listing was consumed to the end
    Complete,
}

impl ResumeCursor {
    fn from_token(token: Option<String>) -> Self {
        match token {
            Some(t) => ResumeCursor::Token(t),
            None => ResumeCursor::FromStart,
        }
    }

    fn after_page(next_cursor: Option<String>) -> Self {
        match next_cursor {
            Some(t) => ResumeCursor::Token(t),
            None => ResumeCursor::Complete,
        }
    }

    /// Token to pass as the start cursor, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            ResumeCursor::Token(t) => Some(t),
            ResumeCursor::FromStart | ResumeCursor::Complete => None,
        }
    }
}

impl fmt::Display for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeCursor::FromStart => write!(f, "<start>"),
            ResumeCursor::Token(t) => write!(f, "{}", t),
            ResumeCursor::Complete => write!(f, "<complete>"),
        }
    }
}

/// An ordered chunk of entries headed for one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub entries: Vec<DiffEntry>,
    pub resume_cursor: ResumeCursor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How far cross-page deduplication reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupScope {
    /// One derived key at most once per run
    #[default]
    Run,
    /// Duplicates are only removed within a listing page
    Page,
}

impl FromStr for DedupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "run" => Ok(DedupScope::Run),
            "page" => Ok(DedupScope::Page),
            other => Err(format!("unknown dedup scope {:?} (expected run or page)", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub pages: u64,
    pub objects_seen: u64,
    pub skipped_non_car: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub emitted: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DiffStreamError {
    #[error("listing failed: {0}")]
    Store(#[from] std::io::Error),
    #[error(transparent)]
    Derive(#[from] DeriveError),
}

/// Bookkeeping for a page whose entries are not all emitted yet
#[derive(Debug)]
struct PendingPage {
    start_cursor: Option<String>,
    next_cursor: Option<String>,
    remaining: usize,
}

/// Dedup and batching state for one run
#[derive(Debug)]
pub struct DiffBuffer {
    batch_size: usize,
    scope: DedupScope,
    seen: AHashSet<ContentId>,
    entries: VecDeque<DiffEntry>,
    pending: VecDeque<PendingPage>,
    settled: ResumeCursor,
    stats: DiffStats,
}

impl DiffBuffer {
    /// `start_cursor` is the cursor the run's listing begins from
    pub fn new(batch_size: usize, scope: DedupScope, start_cursor: Option<String>) -> Self {
        DiffBuffer {
            batch_size: batch_size.clamp(1, BATCH_SIZE_MAX),
            scope,
            seen: AHashSet::new(),
            entries: VecDeque::new(),
            pending: VecDeque::new(),
            settled: ResumeCursor::from_token(start_cursor),
            stats: DiffStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stats(&self) -> &DiffStats {
        &self.stats
    }

    /// Entries buffered but not yet emitted
    pub fn pending_len(&self) -> usize {
        self.entries.len()
    }

    /// Inspect the buffered remainder without consuming it
    pub fn peek(&self) -> impl Iterator<Item = &DiffEntry> + '_ {
        self.entries.iter()
    }

    /// Run one page through filter, derivation and dedup.
    ///
    /// Rejected keys are counted and dropped. A malformed key fails the
    /// page and leaves the buffer untouched.
    pub fn push_page(&mut self, page: Page) -> Result<(), DeriveError> {
        let mut derived = Vec::with_capacity(page.objects.len());
        let mut skipped_non_car = 0;
        let mut rejected = 0;
        for object in page.objects {
            if !object.key.ends_with(CAR_SUFFIX) {
                skipped_non_car += 1;
                continue;
            }
            match derive_content_id(&object.key) {
                Ok(cid) => derived.push((cid, object)),
                Err(e) if e.is_rejected() => {
                    trace!(key = %object.key, "rejected");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.stats.pages += 1;
        self.stats.objects_seen += (derived.len() + skipped_non_car + rejected) as u64;
        self.stats.skipped_non_car += skipped_non_car as u64;
        self.stats.rejected += rejected as u64;

        if self.scope == DedupScope::Page {
            self.seen.clear();
        }

        let before = self.entries.len();
        for (cid, object) in derived {
            if !self.seen.insert(cid) {
                self.stats.duplicates += 1;
                continue;
            }
            self.entries.push_back(DiffEntry {
                source_key: object.key,
                derived_key: destination_key(&cid),
                size: object.size_bytes,
            });
        }
        let added = self.entries.len() - before;

        debug!(
            page = page.seq,
            added,
            buffered = self.entries.len(),
            "page diffed"
        );

        self.pending.push_back(PendingPage {
            start_cursor: page.start_cursor,
            next_cursor: page.next_cursor,
            remaining: added,
        });
        self.settle();
        Ok(())
    }

    /// Emit one full batch if the buffer holds enough entries
    pub fn pop_batch(&mut self) -> Option<Batch> {
        if self.entries.len() < self.batch_size {
            return None;
        }
        Some(self.take(self.batch_size))
    }

    /// Emit everything still buffered as a final, possibly short, batch
    pub fn drain(&mut self) -> Option<Batch> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.take(self.entries.len()))
    }

    fn take(&mut self, n: usize) -> Batch {
        let entries: Vec<DiffEntry> = self.entries.drain(..n).collect();

        let mut left = n;
        for page in self.pending.iter_mut() {
            if left == 0 {
                break;
            }
            let used = left.min(page.remaining);
            page.remaining -= used;
            left -= used;
        }
        debug_assert_eq!(left, 0, "pending pages out of sync with buffer");

        self.settle();
        self.stats.emitted += entries.len() as u64;

        Batch {
            entries,
            resume_cursor: self.resume_cursor(),
        }
    }

    /// Retire fully emitted pages from the front of the queue
    fn settle(&mut self) {
        while let Some(front) = self.pending.front() {
            if front.remaining > 0 {
                break;
            }
            if let Some(done) = self.pending.pop_front() {
                self.settled = ResumeCursor::after_page(done.next_cursor);
            }
        }
    }

    /// Cursor from which a re-run recovers every entry not yet emitted
    pub fn resume_cursor(&self) -> ResumeCursor {
        match self.pending.front() {
            Some(page) => ResumeCursor::from_token(page.start_cursor.clone()),
            None => self.settled.clone(),
        }
    }
}

type PageObserver = Box<dyn FnMut(&DiffStats) + Send>;

/// Pull-based diff over a paginated listing
pub struct DiffStream {
    lister: PaginatedLister,
    buffer: DiffBuffer,
    on_page: Option<PageObserver>,
}

impl DiffStream {
    pub fn new(lister: PaginatedLister, batch_size: usize, scope: DedupScope) -> Self {
        let start = lister.cursor().map(str::to_string);
        DiffStream {
            lister,
            buffer: DiffBuffer::new(batch_size, scope, start),
            on_page: None,
        }
    }

    /// Call `observer` with the running totals after every page
    pub fn on_page<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&DiffStats) + Send + 'static,
    {
        self.on_page = Some(Box::new(observer));
        self
    }

    /// Next full batch, fetching pages as needed. `None` once the
    /// listing is exhausted; a short remainder may still be buffered.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, DiffStreamError> {
        loop {
            if let Some(batch) = self.buffer.pop_batch() {
                return Ok(Some(batch));
            }
            match self.lister.next_page().await? {
                Some(page) => {
                    self.buffer.push_page(page)?;
                    if let Some(observer) = self.on_page.as_mut() {
                        observer(self.buffer.stats());
                    }
                }
                None => return Ok(None),
            }
        }
    }

    pub fn peek(&self) -> impl Iterator<Item = &DiffEntry> + '_ {
        self.buffer.peek()
    }

    pub fn drain(&mut self) -> Option<Batch> {
        self.buffer.drain()
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.pending_len()
    }

    pub fn stats(&self) -> &DiffStats {
        self.buffer.stats()
    }

    /// Cursor covering everything not yet emitted
    pub fn resume_cursor(&self) -> ResumeCursor {
        self.buffer.resume_cursor()
    }

    pub fn is_exhausted(&self) -> bool {
        self.lister.is_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::key_deriver::raw_source_key;
    use crate::store::{InMemoryObjectStore, ObjectMeta, ObjectStore};
    use sha2::{Digest, Sha256};
    use std::sync::Arc;

    fn car_key(seed: u32) -> String {
        let digest: [u8; 32] = Sha256::digest(seed.to_be_bytes()).into();
        raw_source_key("raw/root/user", &digest)
    }

    fn meta(key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: 10,
            etag: None,
        }
    }

    fn page(seq: u64, start: Option<&str>, next: Option<&str>, keys: &[String]) -> Page {
        Page {
            seq,
            start_cursor: start.map(str::to_string),
            objects: keys.iter().map(|k| meta(k)).collect(),
            next_cursor: next.map(str::to_string),
        }
    }

    #[test]
    fn test_batch_sizing_leaves_remainder_until_drained() {
        let keys: Vec<String> = (0..7).map(car_key).collect();
        let mut buffer = DiffBuffer::new(3, DedupScope::Run, None);
        buffer.push_page(page(0, None, None, &keys)).unwrap();

        let first = buffer.pop_batch().unwrap();
        let second = buffer.pop_batch().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert!(buffer.pop_batch().is_none());
        assert_eq!(buffer.peek().count(), 1);

        let last = buffer.drain().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last.entries[0].source_key, keys[6]);
        assert!(buffer.drain().is_none());
        assert_eq!(buffer.stats().emitted, 7);
    }

    #[test]
    fn test_within_page_dedup_first_occurrence_wins() {
        let key = car_key(1);
        let copy = format!("raw/elsewhere/{}", key.rsplit('/').next().unwrap());
        let mut buffer = DiffBuffer::new(10, DedupScope::Page, None);
        buffer
            .push_page(page(0, None, None, &[key.clone(), copy]))
            .unwrap();

        let batch = buffer.drain().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries[0].source_key, key);
        assert_eq!(buffer.stats().duplicates, 1);
    }

    #[test]
    fn test_run_scope_dedups_across_pages() {
        let key = car_key(1);
        let mut run = DiffBuffer::new(10, DedupScope::Run, None);
        run.push_page(page(0, None, Some("a"), &[key.clone()])).unwrap();
        run.push_page(page(1, Some("a"), None, &[key.clone()])).unwrap();
        assert_eq!(run.pending_len(), 1);

        let mut per_page = DiffBuffer::new(10, DedupScope::Page, None);
        per_page
            .push_page(page(0, None, Some("a"), &[key.clone()]))
            .unwrap();
        per_page.push_page(page(1, Some("a"), None, &[key])).unwrap();
        assert_eq!(per_page.pending_len(), 2);
    }

    #[test]
    fn test_filters_non_car_and_rejects() {
        let keys = vec![
            car_key(1),
            "raw/root/user/notes.txt".to_string(),
            "complete/abc.car".to_string(),
            "other/x.car".to_string(),
        ];
        let mut buffer = DiffBuffer::new(10, DedupScope::Run, None);
        buffer.push_page(page(0, None, None, &keys)).unwrap();

        let stats = buffer.stats().clone();
        assert_eq!(stats.objects_seen, 4);
        assert_eq!(stats.skipped_non_car, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn test_malformed_key_is_fatal_and_leaves_buffer() {
        let mut buffer = DiffBuffer::new(10, DedupScope::Run, None);
        let err = buffer
            .push_page(page(0, None, None, &[car_key(1), "raw/x/zz.car".into()]))
            .unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.stats().pages, 0);
    }

    #[test]
    fn test_resume_cursor_tracks_oldest_pending_page() {
        let p0: Vec<String> = (0..2).map(car_key).collect();
        let p1: Vec<String> = (2..4).map(car_key).collect();
        let mut buffer = DiffBuffer::new(3, DedupScope::Run, None);
        buffer.push_page(page(0, None, Some("k1"), &p0)).unwrap();
        assert_eq!(buffer.resume_cursor(), ResumeCursor::FromStart);

        buffer.push_page(page(1, Some("k1"), None, &p1)).unwrap();
        // Three entries: all of page 0 and half of page 1
        let batch = buffer.pop_batch().unwrap();
        assert_eq!(batch.resume_cursor, ResumeCursor::Token("k1".into()));

        let last = buffer.drain().unwrap();
        assert_eq!(last.resume_cursor, ResumeCursor::Complete);
    }

    #[test]
    fn test_resume_cursor_skips_pages_without_entries() {
        let mut buffer = DiffBuffer::new(1, DedupScope::Run, Some("start".into()));
        assert_eq!(buffer.resume_cursor(), ResumeCursor::Token("start".into()));

        buffer
            .push_page(page(0, Some("start"), Some("k1"), &["other/x.car".into()]))
            .unwrap();
        assert_eq!(buffer.resume_cursor(), ResumeCursor::Token("k1".into()));

        buffer
            .push_page(page(1, Some("k1"), Some("k2"), &[car_key(9)]))
            .unwrap();
        let batch = buffer.pop_batch().unwrap();
        assert_eq!(batch.resume_cursor, ResumeCursor::Token("k2".into()));
    }

    #[test]
    fn test_entry_serializes_with_short_field_names() {
        let entry = DiffEntry {
            source_key: "raw/a.car".into(),
            derived_key: "b/b.car".into(),
            size: 42,
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"in":"raw/a.car","out":"b/b.car","size":42}"#
        );
    }

    #[test]
    fn test_dedup_scope_parse() {
        assert_eq!("run".parse::<DedupScope>(), Ok(DedupScope::Run));
        assert_eq!("PAGE".parse::<DedupScope>(), Ok(DedupScope::Page));
        assert!("global".parse::<DedupScope>().is_err());
    }

    #[tokio::test]
    async fn test_stream_pulls_pages_until_batch_fills() {
        let store = InMemoryObjectStore::new();
        let keys: Vec<String> = (0..5).map(car_key).collect();
        for key in &keys {
            store.insert(key.clone(), "data");
        }
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        let lister = PaginatedLister::new(store, None, 2, None);
        let mut stream = DiffStream::new(lister, 4, DedupScope::Run);

        let batch = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(stream.next_batch().await.unwrap().is_none());
        assert!(stream.is_exhausted());
        assert_eq!(stream.peek().count(), 1);
        assert_eq!(stream.drain().unwrap().len(), 1);
        assert_eq!(stream.stats().pages, 3);
    }

    #[tokio::test]
    async fn test_page_observer_sees_every_page() {
        let store = InMemoryObjectStore::new();
        for n in 0..6 {
            store.insert(format!("raw/root/user/notes-{}.txt", n), "x");
        }
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        let lister = PaginatedLister::new(store, None, 2, None);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut stream = DiffStream::new(lister, 4, DedupScope::Run)
            .on_page(move |stats| sink.lock().push((stats.pages, stats.objects_seen)));

        assert!(stream.next_batch().await.unwrap().is_none());
        assert_eq!(*seen.lock(), vec![(1, 2), (2, 4), (3, 6)]);
    }
}
