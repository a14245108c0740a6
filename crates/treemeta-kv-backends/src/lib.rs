//! Backing-table client implementations for treemeta.
//!
//! Provides concrete implementations of the [`treemeta_kv::TableClient`] trait:
//!
//! - **memtable** -- In-memory `BTreeMap`-backed table service with status
//!   transitions and fault injection, used for tests and local runs.

pub mod memtable;

pub use memtable::{CallStats, MemTableClient, MemTableFactory};
