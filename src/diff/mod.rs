//! Create-list core: listing, key derivation, dedup, shards and merge
//!
//! ```text
//! PaginatedLister ──pages──► DiffStream ──batches──► ShardWriter
//!                                                        │
//!                              manifest ◄── merge ◄──────┘
//! ```

pub mod cid;
pub mod key_deriver;
pub mod lister;
pub mod merge;
pub mod shard;
pub mod stream;

pub use cid::{ContentId, ContentIdError};
pub use key_deriver::{derive_content_id, derive_destination_key, DeriveError, Namespace};
pub use lister::{Page, PaginatedLister};
pub use merge::{merge, MergeSummary};
pub use shard::{list_shards, write_shard, ShardWriter};
pub use stream::{
    Batch, DedupScope, DiffBuffer, DiffEntry, DiffStats, DiffStream, DiffStreamError,
    ResumeCursor,
};
