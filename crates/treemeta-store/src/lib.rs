//! treemeta-store: a hierarchical filesystem metadata store kept in a remote,
//! rate-limited key-value table.
//!
//! The table offers only single-item atomicity. The store maintains the tree
//! invariants on the client side: ancestors of live entries are kept live,
//! deletions are tombstones, multi-item writes are chunked and resubmitted
//! under throttling, and the table's schema version is checked before use.

pub mod ancestry;
pub mod batch;
pub mod codec;
pub mod config;
pub mod descendants;
pub mod error;
pub mod metadata;
pub mod path;
pub mod retry;
pub mod store;
pub mod version_guard;

pub use batch::BatchWriteExecutor;
pub use config::StoreConfig;
pub use descendants::Descendants;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use metadata::{DirListing, PathMetadata, Tristate};
pub use path::StorePath;
pub use retry::{NoopRetryListener, RetryEvent, RetryInvoker, RetryListener, RetryPolicy};
pub use store::{MetadataStore, TableMetadataStore, READ_CAPACITY, WRITE_CAPACITY};
pub use version_guard::{BindOutcome, SchemaVersionGuard, VERSION};
