//! In-memory table service backed by `BTreeMap`s.
//!
//! This provides a fully functional [`TableClient`] implementation suitable
//! for testing and local use. Each table lives in memory behind a shared
//! `parking_lot::RwLock`. Items are ordered by `(parent, child)`, so partition
//! queries return children in range-key order.
//!
//! The service mimics the behaviors the metadata store has to cope with:
//! tables pass through `CREATING`/`UPDATING` before becoming `ACTIVE`,
//! batches above [`MAX_BATCH_WRITE_ITEMS`] or with duplicate keys are
//! rejected, and throttling, faults and partially processed batches can be
//! injected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use treemeta_kv::{
    BatchWriteOutcome, CreateTableRequest, Filter, Item, PrimaryKey, ProvisionedThroughput,
    QueryRequest, TableClient, TableClientFactory, TableDescription, TableError, TableResult,
    TableStatus, WriteRequest, MAX_BATCH_WRITE_ITEMS,
};

// ---------------------------------------------------------------------------
// Call statistics
// ---------------------------------------------------------------------------

/// Per-operation call counters, for asserting on backend traffic in tests.
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    pub describe_table: usize,
    pub create_table: usize,
    pub delete_table: usize,
    pub update_table: usize,
    pub get_item: usize,
    pub put_item: usize,
    pub delete_item: usize,
    pub query: usize,
    pub scan: usize,
    pub batch_write: usize,
    /// Number of write requests in each submitted batch, in call order.
    pub batch_sizes: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Fault plan
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FaultPlan {
    /// Data-plane calls still to be rejected as throttled.
    throttles: usize,
    /// Data-plane calls still to be failed with a service error.
    faults: usize,
    /// Batch call index -> number of trailing requests left unprocessed.
    unprocessed: HashMap<usize, usize>,
    /// `create_table` calls still to lose a race against another creator.
    create_races: usize,
    /// Items stored by a concurrent writer once this many more `get_item`
    /// calls have been served.
    deferred: Vec<(String, Item, usize)>,
}

impl FaultPlan {
    fn take(&mut self) -> TableResult<()> {
        if self.throttles > 0 {
            self.throttles -= 1;
            return Err(TableError::Throttled(
                "the level of configured provisioned throughput for the table was exceeded"
                    .to_string(),
            ));
        }
        if self.faults > 0 {
            self.faults -= 1;
            return Err(TableError::Service {
                status: 500,
                message: "injected internal server error".to_string(),
            });
        }
        Ok(())
    }

    /// Count one served `get_item` and hand back the deferred items now due.
    fn tick_deferred(&mut self) -> Vec<(String, Item)> {
        let mut due = Vec::new();
        let mut pending = Vec::with_capacity(self.deferred.len());
        for (table, item, gets) in self.deferred.drain(..) {
            if gets <= 1 {
                due.push((table, item));
            } else {
                pending.push((table, item, gets - 1));
            }
        }
        self.deferred = pending;
        due
    }
}

// ---------------------------------------------------------------------------
// Table state
// ---------------------------------------------------------------------------

struct MemTable {
    description: TableDescription,
    items: BTreeMap<PrimaryKey, Item>,
    /// Describe calls left before a transitional status becomes `ACTIVE`.
    pending_polls: usize,
}

impl MemTable {
    fn describe(&self) -> TableDescription {
        let mut desc = self.description.clone();
        desc.item_count = self.items.len() as u64;
        desc.size_bytes = self.items.values().map(estimate_size).sum();
        desc
    }
}

fn estimate_size(item: &Item) -> u64 {
    let key = item.key.parent.len() + item.key.child.len();
    let attrs: usize = item.attributes().map(|(name, _)| name.len() + 8).sum();
    (key + attrs) as u64
}

struct Inner {
    region: String,
    tables: RwLock<HashMap<String, MemTable>>,
    faults: Mutex<FaultPlan>,
    stats: Mutex<CallStats>,
    activation_polls: AtomicUsize,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// In-memory table service. Clones share the same tables.
#[derive(Clone)]
pub struct MemTableClient {
    inner: Arc<Inner>,
}

impl MemTableClient {
    /// Create an empty service for the given region.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                region: region.into(),
                tables: RwLock::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                stats: Mutex::new(CallStats::default()),
                activation_polls: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of `describe_table` calls that report a transitional status
    /// after a create or update before the table turns `ACTIVE`.
    pub fn set_activation_polls(&self, polls: usize) {
        self.inner.activation_polls.store(polls, Ordering::SeqCst);
    }

    /// Create an `ACTIVE` table directly, without a version marker.
    pub fn create_active_table(&self, name: &str, throughput: ProvisionedThroughput) {
        let table = MemTable {
            description: self.new_description(name, TableStatus::Active, throughput),
            items: BTreeMap::new(),
            pending_polls: 0,
        };
        self.inner.tables.write().insert(name.to_string(), table);
    }

    /// Force a table's status string, e.g. `DELETING` or an unknown value.
    pub fn set_table_status(&self, name: &str, status: &str) {
        if let Some(table) = self.inner.tables.write().get_mut(name) {
            table.description.status = status.to_string();
            table.pending_polls = usize::MAX;
        }
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.inner.tables.read().contains_key(name)
    }

    /// Insert an item bypassing faults and statistics.
    pub fn put_raw(&self, table: &str, item: Item) {
        if let Some(t) = self.inner.tables.write().get_mut(table) {
            t.items.insert(item.key.clone(), item);
        }
    }

    /// Read an item bypassing faults and statistics.
    pub fn get_raw(&self, table: &str, key: &PrimaryKey) -> Option<Item> {
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|t| t.items.get(key).cloned())
    }

    /// All items of a table in key order.
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.inner
            .tables
            .read()
            .get(table)
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject the next `count` data-plane calls as throttled.
    pub fn inject_throttles(&self, count: usize) {
        self.inner.faults.lock().throttles += count;
    }

    /// Fail the next `count` data-plane calls with a service error.
    pub fn inject_faults(&self, count: usize) {
        self.inner.faults.lock().faults += count;
    }

    /// Leave the last `count` requests of the `batch_call`-th (zero-based)
    /// `batch_write` call unprocessed.
    pub fn inject_unprocessed(&self, batch_call: usize, count: usize) {
        self.inner
            .faults
            .lock()
            .unprocessed
            .insert(batch_call, count);
    }

    /// Make the next `count` `create_table` calls lose a race: the table is
    /// created as requested, but the call reports `ResourceInUse` as if
    /// another process had got there first.
    pub fn inject_create_races(&self, count: usize) {
        self.inner.faults.lock().create_races += count;
    }

    /// Store `item` on behalf of a concurrent writer after `gets` more
    /// `get_item` calls have been served.
    pub fn defer_put(&self, table: &str, item: Item, gets: usize) {
        if gets == 0 {
            self.put_raw(table, item);
            return;
        }
        self.inner
            .faults
            .lock()
            .deferred
            .push((table.to_string(), item, gets));
    }

    pub fn stats(&self) -> CallStats {
        self.inner.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.inner.stats.lock() = CallStats::default();
    }

    fn new_description(
        &self,
        name: &str,
        status: TableStatus,
        throughput: ProvisionedThroughput,
    ) -> TableDescription {
        TableDescription {
            name: name.to_string(),
            arn: format!("arn:mem:table:{}:table/{}", self.inner.region, name),
            status: status.as_str().to_string(),
            key_schema: Default::default(),
            throughput,
            item_count: 0,
            size_bytes: 0,
        }
    }

    fn data_plane_check(&self) -> TableResult<()> {
        self.inner.faults.lock().take()
    }

    fn not_found(table: &str) -> TableError {
        TableError::ResourceNotFound(format!("table {} not found", table))
    }

    /// Run `f` against a table for reading.
    fn with_table<T>(&self, table: &str, f: impl FnOnce(&MemTable) -> T) -> TableResult<T> {
        let tables = self.inner.tables.read();
        let t = tables.get(table).ok_or_else(|| Self::not_found(table))?;
        Ok(f(t))
    }

    /// Run `f` against a table for writing.
    fn with_table_mut<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut MemTable) -> T,
    ) -> TableResult<T> {
        let mut tables = self.inner.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| Self::not_found(table))?;
        Ok(f(t))
    }
}

fn collect_matching<'a>(
    items: impl Iterator<Item = &'a Item>,
    filter: Option<&Filter>,
) -> Vec<Item> {
    items
        .filter(|item| filter.map_or(true, |f| f.matches(item)))
        .cloned()
        .collect()
}

#[async_trait]
impl TableClient for MemTableClient {
    fn region(&self) -> &str {
        &self.inner.region
    }

    async fn describe_table(&self, table: &str) -> TableResult<TableDescription> {
        self.inner.stats.lock().describe_table += 1;
        self.with_table_mut(table, |t| {
            let transitional = matches!(
                t.description.table_status(),
                TableStatus::Creating | TableStatus::Updating
            );
            if transitional && t.pending_polls != usize::MAX {
                if t.pending_polls == 0 {
                    t.description.status = TableStatus::Active.as_str().to_string();
                } else {
                    t.pending_polls -= 1;
                }
            }
            t.describe()
        })
    }

    async fn create_table(&self, req: CreateTableRequest) -> TableResult<TableDescription> {
        self.inner.stats.lock().create_table += 1;
        let lost_race = {
            let mut faults = self.inner.faults.lock();
            let lost = faults.create_races > 0;
            if lost {
                faults.create_races -= 1;
            }
            lost
        };
        let mut tables = self.inner.tables.write();
        if tables.contains_key(&req.name) {
            return Err(TableError::ResourceInUse(format!(
                "table already exists: {}",
                req.name
            )));
        }
        let mut description =
            self.new_description(&req.name, TableStatus::Creating, req.throughput);
        description.key_schema = req.key_schema;
        let table = MemTable {
            description,
            items: BTreeMap::new(),
            pending_polls: self.inner.activation_polls.load(Ordering::SeqCst),
        };
        let desc = table.describe();
        tables.insert(req.name.clone(), table);
        tracing::debug!(table = %req.name, "memtable: created table");
        if lost_race {
            return Err(TableError::ResourceInUse(format!(
                "table is being created: {}",
                req.name
            )));
        }
        Ok(desc)
    }

    async fn delete_table(&self, table: &str) -> TableResult<()> {
        self.inner.stats.lock().delete_table += 1;
        match self.inner.tables.write().remove(table) {
            Some(_) => {
                tracing::debug!(table = %table, "memtable: deleted table");
                Ok(())
            }
            None => Err(Self::not_found(table)),
        }
    }

    async fn update_table(
        &self,
        table: &str,
        throughput: ProvisionedThroughput,
    ) -> TableResult<TableDescription> {
        self.inner.stats.lock().update_table += 1;
        let polls = self.inner.activation_polls.load(Ordering::SeqCst);
        self.with_table_mut(table, |t| {
            if t.description.throughput == throughput {
                return Err(TableError::Validation(
                    "the provisioned throughput for the table will not change".to_string(),
                ));
            }
            t.description.throughput = throughput;
            t.description.status = TableStatus::Updating.as_str().to_string();
            t.pending_polls = polls;
            Ok(t.describe())
        })?
    }

    async fn get_item(
        &self,
        table: &str,
        key: &PrimaryKey,
        _consistent_read: bool,
    ) -> TableResult<Option<Item>> {
        self.inner.stats.lock().get_item += 1;
        self.data_plane_check()?;
        let found = self.with_table(table, |t| t.items.get(key).cloned());
        let due = self.inner.faults.lock().tick_deferred();
        for (deferred_table, item) in due {
            self.put_raw(&deferred_table, item);
        }
        found
    }

    async fn put_item(&self, table: &str, item: Item) -> TableResult<()> {
        self.inner.stats.lock().put_item += 1;
        self.data_plane_check()?;
        self.with_table_mut(table, |t| {
            t.items.insert(item.key.clone(), item);
        })
    }

    async fn delete_item(&self, table: &str, key: &PrimaryKey) -> TableResult<()> {
        self.inner.stats.lock().delete_item += 1;
        self.data_plane_check()?;
        self.with_table_mut(table, |t| {
            t.items.remove(key);
        })
    }

    async fn query(&self, table: &str, req: QueryRequest) -> TableResult<Vec<Item>> {
        self.inner.stats.lock().query += 1;
        self.data_plane_check()?;
        self.with_table(table, |t| {
            let items = t
                .items
                .iter()
                .filter(|(k, _)| k.parent == req.parent)
                .map(|(_, v)| v);
            collect_matching(items, req.filter.as_ref())
        })
    }

    async fn scan(&self, table: &str, filter: Option<Filter>) -> TableResult<Vec<Item>> {
        self.inner.stats.lock().scan += 1;
        self.data_plane_check()?;
        self.with_table(table, |t| collect_matching(t.items.values(), filter.as_ref()))
    }

    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> TableResult<BatchWriteOutcome> {
        let call_index = {
            let mut stats = self.inner.stats.lock();
            stats.batch_write += 1;
            stats.batch_sizes.push(requests.len());
            stats.batch_write - 1
        };
        self.data_plane_check()?;

        if requests.is_empty() || requests.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(TableError::Validation(format!(
                "batch must contain between 1 and {} requests, got {}",
                MAX_BATCH_WRITE_ITEMS,
                requests.len()
            )));
        }
        let mut seen = HashSet::new();
        if !requests.iter().all(|r| seen.insert(r.key().clone())) {
            return Err(TableError::Validation(
                "provided list of item keys contains duplicates".to_string(),
            ));
        }

        let skip = self
            .inner
            .faults
            .lock()
            .unprocessed
            .remove(&call_index)
            .unwrap_or(0)
            .min(requests.len());
        let mut requests = requests;
        let unprocessed = requests.split_off(requests.len() - skip);

        self.with_table_mut(table, |t| {
            for request in requests {
                match request {
                    WriteRequest::Put(item) => {
                        t.items.insert(item.key.clone(), item);
                    }
                    WriteRequest::Delete(key) => {
                        t.items.remove(&key);
                    }
                }
            }
        })?;

        Ok(BatchWriteOutcome { unprocessed })
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Hands out clones of one shared [`MemTableClient`].
#[derive(Clone)]
pub struct MemTableFactory {
    client: MemTableClient,
}

impl MemTableFactory {
    pub fn new(client: MemTableClient) -> Self {
        Self { client }
    }
}

impl TableClientFactory for MemTableFactory {
    fn create_client(&self, region: &str) -> TableResult<Arc<dyn TableClient>> {
        if region != self.client.region() {
            return Err(TableError::Validation(format!(
                "memtable service is bound to region {}, not {}",
                self.client.region(),
                region
            )));
        }
        Ok(Arc::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "t1";

    fn throughput() -> ProvisionedThroughput {
        ProvisionedThroughput {
            read_capacity_units: 10,
            write_capacity_units: 5,
        }
    }

    fn item(parent: &str, child: &str) -> Item {
        Item::new(PrimaryKey::new(parent, child)).with_bool("is_deleted", false)
    }

    fn active_client() -> MemTableClient {
        let client = MemTableClient::new("local");
        client.create_active_table(TABLE, throughput());
        client
    }

    #[tokio::test]
    async fn test_create_table_transitions_to_active() {
        let client = MemTableClient::new("local");
        client.set_activation_polls(2);
        let desc = client
            .create_table(CreateTableRequest {
                name: TABLE.to_string(),
                key_schema: Default::default(),
                throughput: throughput(),
            })
            .await
            .unwrap();
        assert_eq!(desc.table_status(), TableStatus::Creating);

        assert_eq!(
            client.describe_table(TABLE).await.unwrap().table_status(),
            TableStatus::Creating
        );
        assert_eq!(
            client.describe_table(TABLE).await.unwrap().table_status(),
            TableStatus::Creating
        );
        assert_eq!(
            client.describe_table(TABLE).await.unwrap().table_status(),
            TableStatus::Active
        );
    }

    #[tokio::test]
    async fn test_create_race_creates_table_but_reports_in_use() {
        let client = MemTableClient::new("local");
        client.inject_create_races(1);
        let request = CreateTableRequest {
            name: TABLE.to_string(),
            key_schema: Default::default(),
            throughput: throughput(),
        };
        let err = client.create_table(request.clone()).await.unwrap_err();
        assert!(matches!(err, TableError::ResourceInUse(_)));
        assert!(client.table_exists(TABLE));
        assert_eq!(
            client.describe_table(TABLE).await.unwrap().table_status(),
            TableStatus::Active
        );
    }

    #[tokio::test]
    async fn test_deferred_put_lands_after_reads() {
        let client = active_client();
        let late = item("/b", "late");
        client.defer_put(TABLE, late.clone(), 2);

        assert!(client.get_item(TABLE, &late.key, true).await.unwrap().is_none());
        assert!(client.get_item(TABLE, &late.key, true).await.unwrap().is_none());
        assert_eq!(client.get_item(TABLE, &late.key, true).await.unwrap(), Some(late));
    }

    #[tokio::test]
    async fn test_create_existing_table_is_in_use() {
        let client = active_client();
        let err = client
            .create_table(CreateTableRequest {
                name: TABLE.to_string(),
                key_schema: Default::default(),
                throughput: throughput(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::ResourceInUse(_)));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let client = MemTableClient::new("local");
        let err = client.describe_table("nope").await.unwrap_err();
        assert!(matches!(err, TableError::ResourceNotFound(_)));
        let err = client.delete_table("nope").await.unwrap_err();
        assert!(matches!(err, TableError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_query_orders_by_child() {
        let client = active_client();
        for child in ["zeta", "alpha", "mid"] {
            client.put_item(TABLE, item("/b/dir", child)).await.unwrap();
        }
        client.put_item(TABLE, item("/b/other", "aaa")).await.unwrap();

        let items = client
            .query(TABLE, QueryRequest::new("/b/dir").consistent())
            .await
            .unwrap();
        let names: Vec<_> = items.iter().map(|i| i.key.child.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_batch_limit_and_duplicates() {
        let client = active_client();
        let too_many: Vec<_> = (0..26)
            .map(|i| WriteRequest::Put(item("/b", &format!("f{}", i))))
            .collect();
        let err = client.batch_write(TABLE, too_many).await.unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));

        let dups = vec![
            WriteRequest::Put(item("/b", "x")),
            WriteRequest::Delete(PrimaryKey::new("/b", "x")),
        ];
        let err = client.batch_write(TABLE, dups).await.unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unprocessed_injection() {
        let client = active_client();
        client.inject_unprocessed(0, 2);
        let requests: Vec<_> = (0..5)
            .map(|i| WriteRequest::Put(item("/b", &format!("f{}", i))))
            .collect();
        let outcome = client.batch_write(TABLE, requests).await.unwrap();
        assert_eq!(outcome.unprocessed.len(), 2);
        assert_eq!(outcome.unprocessed[0].key().child, "f3");
        assert_eq!(client.items(TABLE).len(), 3);

        let outcome = client.batch_write(TABLE, outcome.unprocessed).await.unwrap();
        assert!(outcome.unprocessed.is_empty());
        assert_eq!(client.items(TABLE).len(), 5);
        assert_eq!(client.stats().batch_sizes, vec![5, 2]);
    }

    #[tokio::test]
    async fn test_throttle_and_fault_injection() {
        let client = active_client();
        client.inject_throttles(1);
        client.inject_faults(1);
        let key = PrimaryKey::new("/b", "x");

        let err = client.get_item(TABLE, &key, true).await.unwrap_err();
        assert!(err.is_throttle());
        let err = client.get_item(TABLE, &key, true).await.unwrap_err();
        assert!(matches!(err, TableError::Service { status: 500, .. }));
        assert!(client.get_item(TABLE, &key, true).await.unwrap().is_none());
        assert_eq!(client.stats().get_item, 3);
    }

    #[tokio::test]
    async fn test_update_table_requires_change() {
        let client = active_client();
        let err = client.update_table(TABLE, throughput()).await.unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));

        let new = ProvisionedThroughput {
            read_capacity_units: 20,
            write_capacity_units: 5,
        };
        let desc = client.update_table(TABLE, new).await.unwrap();
        assert_eq!(desc.table_status(), TableStatus::Updating);
        let desc = client.describe_table(TABLE).await.unwrap();
        assert_eq!(desc.table_status(), TableStatus::Active);
        assert_eq!(desc.throughput, new);
    }

    #[tokio::test]
    async fn test_scan_with_filter() {
        let client = active_client();
        client
            .put_item(TABLE, item("/b", "old").with_long("mod_time", 10))
            .await
            .unwrap();
        client
            .put_item(TABLE, item("/b", "new").with_long("mod_time", 500))
            .await
            .unwrap();
        client
            .put_item(TABLE, item("/b", "dir").with_bool("is_dir", true))
            .await
            .unwrap();

        let expired = client
            .scan(TABLE, Some(Filter::LessThan("mod_time".into(), 100)))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key.child, "old");
        assert_eq!(client.describe_table(TABLE).await.unwrap().item_count, 3);
    }

    #[test]
    fn test_factory_checks_region() {
        let factory = MemTableFactory::new(MemTableClient::new("eu-west-1"));
        assert!(factory.create_client("eu-west-1").is_ok());
        assert!(factory.create_client("us-east-1").is_err());
    }
}
