use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TableResult;
use crate::item::{Filter, Item, PrimaryKey, WriteRequest};
use crate::{CHILD_KEY, PARENT_KEY};

/// Lifecycle status of a table as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    Creating,
    Updating,
    Deleting,
    Active,
    /// A status string this client does not know about.
    Unrecognized(String),
}

impl TableStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "CREATING" => TableStatus::Creating,
            "UPDATING" => TableStatus::Updating,
            "DELETING" => TableStatus::Deleting,
            "ACTIVE" => TableStatus::Active,
            other => TableStatus::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TableStatus::Creating => "CREATING",
            TableStatus::Updating => "UPDATING",
            TableStatus::Deleting => "DELETING",
            TableStatus::Active => "ACTIVE",
            TableStatus::Unrecognized(s) => s.as_str(),
        }
    }
}

/// Names of the partition and range key attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub hash_key: String,
    pub range_key: String,
}

impl Default for KeySchema {
    fn default() -> Self {
        Self {
            hash_key: PARENT_KEY.to_string(),
            range_key: CHILD_KEY.to_string(),
        }
    }
}

/// Provisioned read/write capacity units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedThroughput {
    pub read_capacity_units: i64,
    pub write_capacity_units: i64,
}

/// Snapshot of a table's description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub arn: String,
    /// Raw status string; see [`TableStatus::parse`].
    pub status: String,
    pub key_schema: KeySchema,
    pub throughput: ProvisionedThroughput,
    pub item_count: u64,
    pub size_bytes: u64,
}

impl TableDescription {
    pub fn table_status(&self) -> TableStatus {
        TableStatus::parse(&self.status)
    }
}

/// Parameters for table creation.
#[derive(Debug, Clone)]
pub struct CreateTableRequest {
    pub name: String,
    pub key_schema: KeySchema,
    pub throughput: ProvisionedThroughput,
}

/// A range query over one partition.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub parent: String,
    pub consistent_read: bool,
    pub filter: Option<Filter>,
}

impl QueryRequest {
    pub fn new(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            consistent_read: false,
            filter: None,
        }
    }

    pub fn consistent(mut self) -> Self {
        self.consistent_read = true;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Result of a batch write.
///
/// A non-empty `unprocessed` list means the backend accepted only part of
/// the batch; the caller must resubmit the remainder.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    pub unprocessed: Vec<WriteRequest>,
}

/// Client handle for a remote key-value table service bound to one region.
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Region or endpoint the client talks to.
    fn region(&self) -> &str;

    async fn describe_table(&self, table: &str) -> TableResult<TableDescription>;

    async fn create_table(&self, req: CreateTableRequest) -> TableResult<TableDescription>;

    /// Request asynchronous deletion of a table.
    async fn delete_table(&self, table: &str) -> TableResult<()>;

    async fn update_table(
        &self,
        table: &str,
        throughput: ProvisionedThroughput,
    ) -> TableResult<TableDescription>;

    async fn get_item(
        &self,
        table: &str,
        key: &PrimaryKey,
        consistent_read: bool,
    ) -> TableResult<Option<Item>>;

    /// Atomically insert or replace a single item.
    async fn put_item(&self, table: &str, item: Item) -> TableResult<()>;

    /// Delete a single item. Deleting an absent key succeeds.
    async fn delete_item(&self, table: &str, key: &PrimaryKey) -> TableResult<()>;

    /// Items of one partition ordered by range key.
    async fn query(&self, table: &str, req: QueryRequest) -> TableResult<Vec<Item>>;

    /// All items of the table matching `filter`.
    async fn scan(&self, table: &str, filter: Option<Filter>) -> TableResult<Vec<Item>>;

    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> TableResult<BatchWriteOutcome>;
}

/// Builds a [`TableClient`] for a region. Selected by configuration and
/// resolved once when a store is constructed.
pub trait TableClientFactory: Send + Sync {
    fn create_client(&self, region: &str) -> TableResult<Arc<dyn TableClient>>;
}
