//! The metadata store contract and its table-backed implementation.
//!
//! `TableMetadataStore` keeps the tree invariants the backing table cannot
//! enforce on its own:
//!
//! * every live path has live ancestors (up to, not including, the bucket
//!   root), maintained by expanding every write set with missing ancestors;
//! * deletions write tombstones rather than removing items, so a deleted
//!   subtree stays visible as deleted until `prune` ages it out;
//! * the table carries a version marker that must match [`VERSION`] before
//!   any other operation proceeds.
//!
//! There is no locking across operations. Callers serialize conflicting
//! mutations of the same path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, OnceCell};
use treemeta_kv::{
    PrimaryKey, ProvisionedThroughput, QueryRequest, TableClient, TableClientFactory, TableResult,
};

use crate::ancestry::{self, complete_ancestry};
use crate::batch::BatchWriteExecutor;
use crate::codec;
use crate::config::StoreConfig;
use crate::descendants::Descendants;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::metadata::{DirListing, PathMetadata, Tristate};
use crate::path::StorePath;
use crate::retry::{RetryInvoker, RetryListener, RetryPolicy};
use crate::version_guard::{BindOutcome, SchemaVersionGuard, VERSION};

/// Parameter key for [`MetadataStore::update_parameters`].
pub const READ_CAPACITY: &str = "read-capacity";
/// Parameter key for [`MetadataStore::update_parameters`].
pub const WRITE_CAPACITY: &str = "write-capacity";

const DESCRIPTION: &str = "Table-backed metadata store";

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Persistent metadata for a hierarchical namespace.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Metadata of `path`, tombstones included. The bucket root always
    /// resolves to a directory. With `want_empty_directory_flag`, a
    /// directory's `is_empty_directory` is set to `False` when it has live
    /// children and `Unknown` otherwise.
    async fn get(
        &self,
        path: &StorePath,
        want_empty_directory_flag: bool,
    ) -> StoreResult<Option<PathMetadata>>;

    /// Direct children of `path` in name order, tombstones included. `None`
    /// when there are no children and `path` itself does not exist.
    async fn list_children(&self, path: &StorePath) -> StoreResult<Option<DirListing>>;

    async fn put(&self, meta: PathMetadata) -> StoreResult<()>;

    async fn put_all(&self, metas: Vec<PathMetadata>) -> StoreResult<()>;

    /// Save a directory together with its listed children.
    async fn put_listing(&self, listing: DirListing) -> StoreResult<()>;

    /// Tombstone `path`.
    async fn delete(&self, path: &StorePath) -> StoreResult<()>;

    /// Physically remove the item of `path`.
    async fn forget_metadata(&self, path: &StorePath) -> StoreResult<()>;

    /// Tombstone `path` and everything live below it.
    async fn delete_subtree(&self, path: &StorePath) -> StoreResult<()>;

    /// Tombstone `paths_to_delete` and save `paths_to_create` (with their
    /// ancestors) in one batched write.
    async fn move_paths(
        &self,
        paths_to_delete: Option<Vec<StorePath>>,
        paths_to_create: Option<Vec<PathMetadata>>,
    ) -> StoreResult<()>;

    /// Physically remove file entries and tombstones modified before
    /// `mod_time` (milliseconds since the epoch). Returns the number removed.
    async fn prune(&self, mod_time: i64) -> StoreResult<usize>;

    /// Delete the backing table, bound or not. A table that does not
    /// exist is not an error.
    async fn destroy(&self) -> StoreResult<()>;

    async fn diagnostics(&self) -> StoreResult<BTreeMap<String, String>>;

    async fn update_parameters(&self, parameters: &HashMap<String, String>) -> StoreResult<()>;

    /// Interrupt backoff sleeps; later sleeps fail immediately.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// Table-backed implementation
// ---------------------------------------------------------------------------

pub struct TableMetadataStore {
    config: StoreConfig,
    client: Arc<dyn TableClient>,
    invoker: RetryInvoker,
    binding: OnceCell<BindOutcome>,
    destroyed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl TableMetadataStore {
    /// Validate `config` and resolve the backend client. Does not touch the
    /// table; see [`initialize`](Self::initialize).
    pub fn new(
        config: StoreConfig,
        factory: &dyn TableClientFactory,
        listener: Arc<dyn RetryListener>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let invoker = RetryInvoker::new(
            RetryPolicy::from_config(&config),
            config.table_name.clone(),
            config.region.clone(),
            listener,
            config.throttle_log_limit,
            shutdown_rx,
        );
        let client = factory
            .create_client(&config.region)
            .map_err(|e| invoker.translate("createClient", &config.region, e))?;

        Ok(Self {
            config,
            client,
            invoker,
            binding: OnceCell::new(),
            destroyed: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Bind to the table now instead of on first use.
    pub async fn initialize(&self) -> StoreResult<()> {
        let outcome = self.bound().await?;
        tracing::info!(
            "Bound to table {} in region {} (version {}, created by this store: {})",
            self.table(),
            self.region(),
            outcome.version,
            outcome.created_table
        );
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn table(&self) -> &str {
        &self.config.table_name
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Throttle events seen by this store instance.
    pub fn throttle_event_count(&self) -> u64 {
        self.invoker.throttle_events()
    }

    /// Change the provisioned capacity; `None` keeps the current value.
    /// Waits until the table is active again.
    pub async fn update_capacity(&self, read: Option<i64>, write: Option<i64>) -> StoreResult<()> {
        self.bound().await?;
        let table = self.table();
        let current = self
            .invoker
            .once("describe", table, || self.client.describe_table(table))
            .await?
            .throughput;

        let wanted = ProvisionedThroughput {
            read_capacity_units: read.unwrap_or(current.read_capacity_units),
            write_capacity_units: write.unwrap_or(current.write_capacity_units),
        };
        if wanted.read_capacity_units <= 0 || wanted.write_capacity_units <= 0 {
            return Err(StoreError::invalid(format!(
                "capacity must be positive, got read: {}, write: {}",
                wanted.read_capacity_units, wanted.write_capacity_units
            )));
        }
        if wanted == current {
            tracing::info!(
                "Table capacity unchanged at read: {}, write: {}",
                current.read_capacity_units,
                current.write_capacity_units
            );
            return Ok(());
        }

        tracing::info!(
            "Current table capacity is read: {}, write: {}",
            current.read_capacity_units,
            current.write_capacity_units
        );
        tracing::info!(
            "Changing capacity of table to read: {}, write: {}",
            wanted.read_capacity_units,
            wanted.write_capacity_units
        );
        let provisioned = self
            .invoker
            .retry("ProvisionTable", table, true, || {
                self.client.update_table(table, wanted)
            })
            .await?
            .throughput;
        tracing::info!(
            "Provision table {} in region {}: readCapacityUnits={}, writeCapacityUnits={}",
            table,
            self.region(),
            provisioned.read_capacity_units,
            provisioned.write_capacity_units
        );
        self.guard().wait_for_table_active().await
    }

    fn guard(&self) -> SchemaVersionGuard<'_> {
        SchemaVersionGuard::new(self.client.as_ref(), &self.invoker, &self.config)
    }

    /// Run the version guard once; concurrent first callers share the
    /// attempt, and a failed attempt is retried by the next caller.
    async fn bound(&self) -> StoreResult<&BindOutcome> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StoreError::TableNotFound {
                table: self.table().to_string(),
                region: self.region().to_string(),
                reason: "the table has been destroyed".to_string(),
            });
        }
        self.binding
            .get_or_try_init(|| async { self.guard().bind().await })
            .await
    }

    fn is_bound(&self) -> bool {
        self.binding.initialized() && !self.destroyed.load(Ordering::Acquire)
    }

    async fn write_batch(
        &self,
        keys_to_delete: Vec<PrimaryKey>,
        metas: &[PathMetadata],
    ) -> StoreResult<usize> {
        let items = codec::path_metadata_to_items(metas)?;
        BatchWriteExecutor::new(
            self.client.as_ref(),
            &self.invoker,
            self.config.batch_write_limit,
        )
        .write(keys_to_delete, items)
        .await
    }

    /// `meta` plus its missing ancestors, confirmed against the table.
    async fn full_paths_to_put(&self, meta: &PathMetadata) -> StoreResult<Vec<PathMetadata>> {
        let ancestors = ancestry::ancestor_keys(&meta.path)?;
        let table = self.table();
        let owner = self.config.owner.as_str();
        self.invoker
            .retry("paths to put", &meta.path.to_string(), true, || {
                ancestry::full_paths_to_put(self.client.as_ref(), table, meta, &ancestors, owner)
            })
            .await
    }

    async fn read_entry(
        &self,
        path: &StorePath,
        key: &PrimaryKey,
        want_empty_directory_flag: bool,
    ) -> TableResult<Option<PathMetadata>> {
        let table = self.table();
        let item = self.client.get_item(table, key, true).await?;
        let Some(mut meta) = item
            .as_ref()
            .and_then(|item| codec::item_to_path_metadata(item, &self.config.owner))
        else {
            return Ok(None);
        };
        if want_empty_directory_flag && meta.is_dir {
            let request = QueryRequest::new(codec::path_to_parent_key(path))
                .consistent()
                .with_filter(codec::live_items_filter());
            let has_children = !self.client.query(table, request).await?.is_empty();
            // A listing query cannot prove emptiness.
            meta.is_empty_directory = if has_children {
                Tristate::False
            } else {
                Tristate::Unknown
            };
        }
        Ok(Some(meta))
    }
}

/// Collapse entries for the same path; the later entry wins and takes the
/// slot of the first.
fn dedupe_later_wins(metas: Vec<PathMetadata>) -> Vec<PathMetadata> {
    let mut slots: HashMap<StorePath, usize> = HashMap::with_capacity(metas.len());
    let mut deduped: Vec<PathMetadata> = Vec::with_capacity(metas.len());
    for meta in metas {
        match slots.get(&meta.path) {
            Some(&slot) => deduped[slot] = meta,
            None => {
                slots.insert(meta.path.clone(), deduped.len());
                deduped.push(meta);
            }
        }
    }
    deduped
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl MetadataStore for TableMetadataStore {
    async fn get(
        &self,
        path: &StorePath,
        want_empty_directory_flag: bool,
    ) -> StoreResult<Option<PathMetadata>> {
        self.bound().await?;
        tracing::debug!(
            "Get from table {} in region {}: {}",
            self.table(),
            self.region(),
            path
        );
        if path.is_root() {
            return Ok(Some(PathMetadata::directory(
                path.clone(),
                self.config.owner.as_str(),
            )));
        }

        let key = codec::path_to_key(path)?;
        self.invoker
            .once("get", &path.to_string(), || {
                self.read_entry(path, &key, want_empty_directory_flag)
            })
            .await
    }

    async fn list_children(&self, path: &StorePath) -> StoreResult<Option<DirListing>> {
        self.bound().await?;
        let table = self.table();
        let request = QueryRequest::new(codec::path_to_parent_key(path)).consistent();
        let items = self
            .invoker
            .once("listChildren", &path.to_string(), || {
                self.client.query(table, request)
            })
            .await?;

        let owner = self.config.owner.as_str();
        let metas: Vec<PathMetadata> = items
            .iter()
            .filter_map(|item| codec::item_to_path_metadata(item, owner))
            .collect();
        if metas.is_empty() && self.get(path, false).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(DirListing::new(path.clone(), metas, false)))
    }

    async fn put(&self, meta: PathMetadata) -> StoreResult<()> {
        self.bound().await?;
        tracing::debug!(
            "Saving to table {} in region {}: {}",
            self.table(),
            self.region(),
            meta.path
        );
        let metas = self.full_paths_to_put(&meta).await?;
        self.write_batch(Vec::new(), &metas).await?;
        Ok(())
    }

    async fn put_all(&self, metas: Vec<PathMetadata>) -> StoreResult<()> {
        self.bound().await?;
        let completed = complete_ancestry(metas, &self.config.owner);
        tracing::debug!(
            "Saving batch of {} items to table {}, region {}",
            completed.len(),
            self.table(),
            self.region()
        );
        self.write_batch(Vec::new(), &completed).await?;
        Ok(())
    }

    async fn put_listing(&self, listing: DirListing) -> StoreResult<()> {
        self.bound().await?;
        tracing::debug!(
            "Saving to table {} in region {}: listing of {} with {} entries",
            self.table(),
            self.region(),
            listing.path,
            listing.listing.len()
        );
        let dir = PathMetadata::directory(listing.path.clone(), self.config.owner.as_str())
            .with_empty_directory(listing.is_empty());
        let mut metas = self.full_paths_to_put(&dir).await?;
        metas.extend(
            listing
                .listing
                .into_iter()
                .filter(|child| !child.path.is_root()),
        );
        let metas = dedupe_later_wins(metas);
        self.write_batch(Vec::new(), &metas).await?;
        Ok(())
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        self.bound().await?;
        if path.is_root() {
            tracing::debug!("Skip deleting root directory as it does not exist in table");
            return Ok(());
        }
        tracing::debug!(
            "Deleting from table {} in region {}: {}",
            self.table(),
            self.region(),
            path
        );
        let item = codec::path_metadata_to_item(&PathMetadata::tombstone(path.clone(), now_millis()))?;
        let table = self.table();
        self.invoker
            .retry("Put tombstone", &path.to_string(), true, || {
                self.client.put_item(table, item.clone())
            })
            .await
    }

    async fn forget_metadata(&self, path: &StorePath) -> StoreResult<()> {
        self.bound().await?;
        if path.is_root() {
            tracing::debug!("Skip deleting root directory as it does not exist in table");
            return Ok(());
        }
        tracing::debug!(
            "Forgetting in table {} in region {}: {}",
            self.table(),
            self.region(),
            path
        );
        let key = codec::path_to_key(path)?;
        let table = self.table();
        self.invoker
            .retry("Delete key", &path.to_string(), true, || {
                self.client.delete_item(table, &key)
            })
            .await
    }

    async fn delete_subtree(&self, path: &StorePath) -> StoreResult<()> {
        self.bound().await?;
        tracing::debug!(
            "Deleting subtree from table {} in region {}: {}",
            self.table(),
            self.region(),
            path
        );
        let Some(root) = self.get(path, false).await?.filter(PathMetadata::is_live) else {
            tracing::debug!("Subtree path {} does not exist; this will be a no-op", path);
            return Ok(());
        };

        let subtree = Descendants::new(self, root).collect().await?;
        let now = now_millis();
        let tombstones: Vec<PathMetadata> = subtree
            .into_iter()
            .rev()
            .filter(|meta| !meta.path.is_root())
            .map(|meta| PathMetadata::tombstone(meta.path, now))
            .collect();
        let count = self.write_batch(Vec::new(), &tombstones).await?;
        tracing::debug!("Tombstoned {} entries under {}", count, path);
        Ok(())
    }

    async fn move_paths(
        &self,
        paths_to_delete: Option<Vec<StorePath>>,
        paths_to_create: Option<Vec<PathMetadata>>,
    ) -> StoreResult<()> {
        if paths_to_delete.is_none() && paths_to_create.is_none() {
            return Ok(());
        }
        self.bound().await?;
        tracing::debug!(
            "Moving paths of table {} in region {}: {} paths to delete and {} paths to create",
            self.table(),
            self.region(),
            paths_to_delete.as_ref().map_or(0, Vec::len),
            paths_to_create.as_ref().map_or(0, Vec::len)
        );

        let mut new_items = Vec::new();
        if let Some(create) = paths_to_create {
            new_items.extend(complete_ancestry(create, &self.config.owner));
        }
        if let Some(delete) = paths_to_delete {
            let now = now_millis();
            new_items.extend(
                delete
                    .into_iter()
                    .filter(|path| !path.is_root())
                    .map(|path| PathMetadata::tombstone(path, now)),
            );
        }
        let new_items = dedupe_later_wins(new_items);
        tracing::trace!("move: {} entries to write", new_items.len());
        self.write_batch(Vec::new(), &new_items).await?;
        Ok(())
    }

    async fn prune(&self, mod_time: i64) -> StoreResult<usize> {
        self.bound().await?;
        let table = self.table();
        let expired = self
            .invoker
            .retry("prune", table, true, || {
                self.client
                    .scan(table, Some(codec::expired_items_filter(mod_time)))
            })
            .await?;
        let keys: Vec<PrimaryKey> = expired
            .into_iter()
            .map(|item| item.key)
            .filter(|key| codec::key_to_path(key).is_some())
            .collect();

        let limit = self.config.batch_write_limit.max(1);
        let mut pruned = 0;
        for chunk in keys.chunks(limit) {
            self.invoker
                .pause("prune", table, self.config.background_sleep)
                .await?;
            pruned += self.write_batch(chunk.to_vec(), &[]).await?;
        }
        tracing::info!(
            "Finished pruning {} items in batches of {} from table {} in region {}",
            pruned,
            limit,
            table,
            self.region()
        );
        Ok(pruned)
    }

    async fn destroy(&self) -> StoreResult<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Table {} already destroyed", self.table());
            return Ok(());
        }

        let table = self.table();
        tracing::info!("Deleting table {} in region {}", table, self.region());
        match self
            .invoker
            .retry("delete", table, true, || self.client.delete_table(table))
            .await
        {
            Ok(()) => self.guard().wait_for_table_deleted().await,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(
                    "Table {} in region {} was not found while deleting; it may have been \
                     deleted by another concurrent thread or process",
                    table,
                    self.region()
                );
                Ok(())
            }
            Err(e) => {
                self.destroyed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn diagnostics(&self) -> StoreResult<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        if self.is_bound() {
            let table = self.table();
            let desc = self
                .invoker
                .once("describe", table, || self.client.describe_table(table))
                .await?;
            map.insert("name".to_string(), desc.name.clone());
            map.insert("status".to_string(), desc.status.clone());
            map.insert("arn".to_string(), desc.arn.clone());
            map.insert("size".to_string(), desc.size_bytes.to_string());
            map.insert("item-count".to_string(), desc.item_count.to_string());
            map.insert(
                READ_CAPACITY.to_string(),
                desc.throughput.read_capacity_units.to_string(),
            );
            map.insert(
                WRITE_CAPACITY.to_string(),
                desc.throughput.write_capacity_units.to_string(),
            );
            map.insert("table".to_string(), format!("{:?}", desc));
        } else {
            map.insert("name".to_string(), "Table Metadata Store".to_string());
            map.insert("table".to_string(), "none".to_string());
            map.insert("status".to_string(), "undefined".to_string());
        }
        map.insert("description".to_string(), DESCRIPTION.to_string());
        map.insert("region".to_string(), self.region().to_string());
        map.insert("retryPolicy".to_string(), self.invoker.policy().to_string());
        map.insert(
            "throttleEvents".to_string(),
            self.throttle_event_count().to_string(),
        );
        Ok(map)
    }

    async fn update_parameters(&self, parameters: &HashMap<String, String>) -> StoreResult<()> {
        let parse = |key: &str| -> StoreResult<Option<i64>> {
            parameters
                .get(key)
                .map(|value| {
                    value.trim().parse::<i64>().map_err(|e| {
                        StoreError::invalid(format!("{} = {:?}: {}", key, value, e))
                    })
                })
                .transpose()
        };
        let read = parse(READ_CAPACITY)?;
        let write = parse(WRITE_CAPACITY)?;
        self.update_capacity(read, write).await
    }

    fn close(&self) {
        tracing::debug!("Closing store for table {}", self.table());
        self.shutdown.send_replace(true);
    }
}

impl fmt::Display for TableMetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TableMetadataStore{{region={}, tableName={}}}",
            self.region(),
            self.table()
        )
    }
}

impl fmt::Debug for TableMetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMetadataStore")
            .field("table", &self.config.table_name)
            .field("region", &self.config.region)
            .field("bound", &self.is_bound())
            .field("version", &VERSION)
            .finish()
    }
}
