//! treemeta-kv: the boundary to the remote key-value table backing the
//! metadata store.
//!
//! The table is addressed by a two-part primary key (a partition key and a
//! range key ordered within the partition). It offers single-item atomicity,
//! strongly consistent single-item reads on request, partition-scoped range
//! queries, full scans, and unordered batch writes that may be partially
//! rejected under throttling.

mod error;
mod item;
mod table;

pub use error::{TableError, TableResult};
pub use item::{AttributeValue, Filter, Item, PrimaryKey, WriteRequest};
pub use table::*;

/// Name of the partition key attribute.
pub const PARENT_KEY: &str = "parent";

/// Name of the range key attribute.
pub const CHILD_KEY: &str = "child";

/// Largest number of write requests the backend accepts in one batch.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema_default() {
        let schema = KeySchema::default();
        assert_eq!(schema.hash_key, PARENT_KEY);
        assert_eq!(schema.range_key, CHILD_KEY);
    }

    #[test]
    fn test_table_status_parse() {
        assert_eq!(TableStatus::parse("ACTIVE"), TableStatus::Active);
        assert_eq!(TableStatus::parse("CREATING"), TableStatus::Creating);
        assert_eq!(TableStatus::parse("UPDATING"), TableStatus::Updating);
        assert_eq!(TableStatus::parse("DELETING"), TableStatus::Deleting);
        assert_eq!(
            TableStatus::parse("ARCHIVED"),
            TableStatus::Unrecognized("ARCHIVED".to_string())
        );
        assert_eq!(TableStatus::Creating.as_str(), "CREATING");
    }
}
