//! Diff an origin bucket of CAR files against carpark-keyed storage
//!
//! The create-list pipeline lists the origin page by page, derives the
//! `{cid}/{cid}.car` key each CAR should have, writes batches to numbered
//! NDJSON shards, merges them into one manifest and publishes it. The
//! update-list pass reads a manifest back and keeps the entries the
//! destination bucket is still missing.
//!
//! Every storage access goes through [`store::ObjectStore`], so the same
//! pipeline runs against S3, a local directory, an in-memory map or the
//! fault-injecting store used by the deterministic simulation tests.

pub mod config;
pub mod diff;
pub mod dst;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod update;

pub use config::{BucketConfig, ConfigError, CreateListConfig, UpdateListConfig};
pub use diff::{ContentId, DiffEntry, DiffStream, PaginatedLister, ResumeCursor};
pub use pipeline::{PipelineConfig, PipelineError, PipelineRunner};
pub use publish::{PublishError, Publisher};
pub use store::ObjectStore;
pub use update::UpdateListRunner;
