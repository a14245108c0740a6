//! Table binding: status checks, auto-creation and the schema version gate.

use chrono::{TimeZone, Utc};
use treemeta_kv::{
    CreateTableRequest, Item, KeySchema, ProvisionedThroughput, TableClient, TableError,
    TableStatus,
};

use crate::codec::{
    create_version_marker, extract_creation_time_from_marker, extract_version_from_marker,
    version_marker_key,
};
use crate::config::StoreConfig;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::retry::RetryInvoker;

/// Schema version written to, and expected in, the version marker.
pub const VERSION: i64 = 100;

/// What a successful bind found or did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The table was created by this bind.
    pub created_table: bool,
    pub version: i64,
    /// Marker creation time in milliseconds since the epoch.
    pub created_at: Option<i64>,
}

/// Fail unless `marker` is present and carries [`VERSION`].
pub fn verify_version_compatibility(table: &str, marker: Option<&Item>) -> StoreResult<i64> {
    let Some(marker) = marker else {
        tracing::warn!("Table {} contains no version marker", table);
        return Err(StoreError::NoVersionMarker {
            table: table.to_string(),
        });
    };
    let version = extract_version_from_marker(marker)?;
    if version != VERSION {
        return Err(StoreError::IncompatibleVersion {
            table: table.to_string(),
            expected: VERSION,
            actual: version,
        });
    }
    Ok(version)
}

/// Runs the bind-time state machine over the table status.
pub struct SchemaVersionGuard<'a> {
    client: &'a dyn TableClient,
    invoker: &'a RetryInvoker,
    config: &'a StoreConfig,
}

impl<'a> SchemaVersionGuard<'a> {
    pub fn new(
        client: &'a dyn TableClient,
        invoker: &'a RetryInvoker,
        config: &'a StoreConfig,
    ) -> Self {
        Self {
            client,
            invoker,
            config,
        }
    }

    fn table(&self) -> &str {
        &self.config.table_name
    }

    fn region(&self) -> &str {
        self.invoker.region()
    }

    /// Bind to the table, creating it if absent and permitted, and check its
    /// version marker.
    pub async fn bind(&self) -> StoreResult<BindOutcome> {
        let table = self.table();
        tracing::debug!("Binding to table {}", table);

        let description = match self.client.describe_table(table).await {
            Ok(description) => description,
            Err(TableError::ResourceNotFound(reason)) => {
                if self.config.create_table {
                    return self.create_table().await;
                }
                return Err(StoreError::TableNotFound {
                    table: table.to_string(),
                    region: self.region().to_string(),
                    reason: format!("auto-creation is turned off ({})", reason),
                });
            }
            Err(e) => return Err(self.invoker.translate("initTable", table, e)),
        };
        tracing::debug!("Table state: {:?}", description);

        match description.table_status() {
            TableStatus::Creating => {
                tracing::debug!(
                    "Table {} in region {} is being created by another thread or process; \
                     waiting for active",
                    table,
                    self.region()
                );
                self.wait_for_table_active().await?;
            }
            TableStatus::Deleting => return Err(self.unavailable("table is being deleted")),
            TableStatus::Updating => tracing::debug!("Table is being updated"),
            TableStatus::Active => {}
            TableStatus::Unrecognized(status) => {
                return Err(self.unavailable(format!("Unknown table status {}", status)));
            }
        }

        let marker = self.version_marker().await?;
        let version = verify_version_compatibility(table, marker.as_ref())?;
        let created_at = marker.as_ref().and_then(extract_creation_time_from_marker);
        tracing::debug!(
            "Using existing table {} in region {} created {}",
            table,
            self.region(),
            format_millis(created_at)
        );
        Ok(BindOutcome {
            created_table: false,
            version,
            created_at,
        })
    }

    /// Read the version marker, re-reading with backoff while it is absent
    /// in case a concurrent process is still creating the table.
    async fn version_marker(&self) -> StoreResult<Option<Item>> {
        let table = self.table();
        let key = version_marker_key();
        let mut backoff = self.invoker.policy().backoff();
        loop {
            let marker = self
                .invoker
                .retry("getVersionMarker", table, true, || {
                    self.client.get_item(table, &key, true)
                })
                .await?;
            if marker.is_some() {
                return Ok(marker);
            }
            match backoff.next_wait() {
                Some(wait) => {
                    tracing::debug!("Sleeping {:?} before re-reading the version marker", wait);
                    self.invoker.pause("getVersionMarker", table, wait).await?;
                }
                None => return Ok(None),
            }
        }
    }

    async fn create_table(&self) -> StoreResult<BindOutcome> {
        let table = self.table();
        tracing::info!(
            "Creating non-existent table {} in region {}",
            table,
            self.region()
        );
        let request = CreateTableRequest {
            name: table.to_string(),
            key_schema: KeySchema::default(),
            throughput: ProvisionedThroughput {
                read_capacity_units: self.config.read_capacity,
                write_capacity_units: self.config.write_capacity,
            },
        };
        match self.client.create_table(request).await {
            Ok(_) => tracing::debug!("Awaiting table becoming active"),
            Err(TableError::ResourceInUse(_)) => tracing::warn!(
                "Table {} in region {} already exists; it may have been created by \
                 another concurrent thread or process",
                table,
                self.region()
            ),
            Err(e) => return Err(self.invoker.translate("createTable", table, e)),
        }
        self.wait_for_table_active().await?;

        let created_at = Utc::now().timestamp_millis();
        let marker = create_version_marker(VERSION, created_at);
        self.invoker
            .retry("putVersionMarker", table, true, || {
                self.client.put_item(table, marker.clone())
            })
            .await?;
        Ok(BindOutcome {
            created_table: true,
            version: VERSION,
            created_at: Some(created_at),
        })
    }

    /// Poll until the table reports `ACTIVE`.
    pub async fn wait_for_table_active(&self) -> StoreResult<()> {
        let table = self.table();
        for poll in 0..self.config.table_wait_max_polls {
            let description = self
                .invoker
                .retry("describeTable", table, true, || self.client.describe_table(table))
                .await?;
            match description.table_status() {
                TableStatus::Active => return Ok(()),
                TableStatus::Deleting => return Err(self.unavailable("table is being deleted")),
                status => tracing::trace!(poll, "Table {} is {}", table, status.as_str()),
            }
            self.poll_pause("waitForTableActive").await?;
        }
        Err(self.unavailable(format!(
            "table is not active after {} polls",
            self.config.table_wait_max_polls
        )))
    }

    /// Poll until describing the table reports it missing.
    pub async fn wait_for_table_deleted(&self) -> StoreResult<()> {
        let table = self.table();
        for _ in 0..self.config.table_wait_max_polls {
            match self
                .invoker
                .retry("describeTable", table, true, || self.client.describe_table(table))
                .await
            {
                Ok(description) => {
                    tracing::trace!("Table {} is still {}", table, description.status)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
            self.poll_pause("waitForTableDeleted").await?;
        }
        Err(self.unavailable(format!(
            "table still exists after {} polls",
            self.config.table_wait_max_polls
        )))
    }

    async fn poll_pause(&self, operation: &str) -> StoreResult<()> {
        let result = self
            .invoker
            .pause(operation, self.table(), self.config.table_poll_interval)
            .await;
        if result.is_err() {
            tracing::warn!(
                "Interrupted while waiting for table {} in region {}",
                self.table(),
                self.region()
            );
        }
        result
    }

    fn unavailable(&self, reason: impl Into<String>) -> StoreError {
        StoreError::TableUnavailable {
            table: self.table().to_string(),
            region: self.region().to_string(),
            reason: reason.into(),
        }
    }
}

fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "at an unknown time".to_string())
}
