//! Paginated listing of the origin bucket
//!
//! `PaginatedLister` turns the single-page listing call into a lazy,
//! forward-only sequence of pages. It holds at most one live cursor and
//! keeps no state across invocations: a run resumes only by passing a
//! previously observed cursor as the start cursor.

use crate::store::{ObjectMeta, ObjectStore};
use futures::stream::{self, Stream};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;
use tracing::debug;

// TigerStyle: Explicit limits with _MAX suffix
/// S3 never returns more than 1000 keys per page
pub const PAGE_SIZE_MAX: usize = 1000;

/// One listing page
#[derive(Debug, Clone)]
pub struct Page {
    /// Sequence number within this run, starting at 0
    pub seq: u64,
    /// Cursor this page was requested with; `None` for the first page of a listing
    pub start_cursor: Option<String>,
    /// Objects in listing order, directory markers removed
    pub objects: Vec<ObjectMeta>,
    /// Cursor to resume after this page; `None` on the last page
    pub next_cursor: Option<String>,
}

pub struct PaginatedLister {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    page_size: usize,
    cursor: Option<String>,
    next_seq: u64,
    exhausted: bool,
}

impl PaginatedLister {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: Option<String>,
        page_size: usize,
        start_cursor: Option<String>,
    ) -> Self {
        PaginatedLister {
            store,
            prefix: prefix.filter(|p| !p.is_empty()),
            page_size: page_size.clamp(1, PAGE_SIZE_MAX),
            cursor: start_cursor,
            next_seq: 0,
            exhausted: false,
        }
    }

    /// Cursor the next request will be issued with
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Directory placeholders some stores report as zero-byte objects
    fn is_directory_marker(&self, object: &ObjectMeta) -> bool {
        object.key.ends_with('/') || self.prefix.as_deref() == Some(object.key.as_str())
    }

    /// Fetch the next page, or `None` once the store reports no cursor
    pub async fn next_page(&mut self) -> IoResult<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }

        let listed = self
            .store
            .list_page(self.prefix.as_deref(), self.page_size, self.cursor.as_deref())
            .await?;

        if listed.next_token.is_some() && listed.next_token == self.cursor {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("listing cursor did not advance past {:?}", self.cursor),
            ));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.exhausted = listed.next_token.is_none();
        let start_cursor = std::mem::replace(&mut self.cursor, listed.next_token.clone());

        debug!(
            page = seq,
            objects = listed.objects.len(),
            cursor = ?listed.next_token,
            "listed page"
        );

        let objects = listed
            .objects
            .into_iter()
            .filter(|o| !self.is_directory_marker(o))
            .collect();

        Ok(Some(Page {
            seq,
            start_cursor,
            objects,
            next_cursor: listed.next_token,
        }))
    }

    /// Adapt into a `Stream` of pages
    pub fn into_stream(self) -> impl Stream<Item = IoResult<Page>> + Send {
        stream::try_unfold(self, |mut lister| async move {
            Ok(lister.next_page().await?.map(|page| (page, lister)))
        })
    }
}

impl std::fmt::Debug for PaginatedLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginatedLister")
            .field("prefix", &self.prefix)
            .field("page_size", &self.page_size)
            .field("cursor", &self.cursor)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
