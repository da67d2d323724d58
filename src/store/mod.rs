//! Bucket access
//!
//! Every store the pipeline talks to goes through the `ObjectStore` trait.
//! Retries and fault injection are wrappers around another store.

pub mod object_store;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod simulated_store;

pub use object_store::{
    GetResponse, InMemoryObjectStore, ListPage, LocalFsObjectStore, ObjectMeta, ObjectStore,
    StoreFuture,
};
pub use retry::{is_transient, RetryPolicy, RetryingObjectStore};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
