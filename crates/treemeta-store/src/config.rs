//! Configuration for the table-backed metadata store.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use treemeta_kv::MAX_BATCH_WRITE_ITEMS;

use crate::error::{StoreError, StoreResult};

/// Configuration for [`TableMetadataStore`](crate::TableMetadataStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the backing table.
    pub table_name: String,

    /// Region or endpoint hosting the table.
    pub region: String,

    /// Owner stamped on metadata read back and on synthesized directories.
    pub owner: String,

    /// Create the table when it does not exist.
    pub create_table: bool,

    /// Read capacity units provisioned on table creation.
    pub read_capacity: i64,

    /// Write capacity units provisioned on table creation.
    pub write_capacity: i64,

    /// Retry budget shared by policy retries, version-marker reads and
    /// unprocessed batch resubmission.
    pub max_retries: u32,

    /// Base delay of the exponential backoff.
    #[serde(with = "humantime_compat")]
    pub min_retry_sleep: Duration,

    /// Cap on a single backoff delay.
    #[serde(with = "humantime_compat")]
    pub max_retry_sleep: Duration,

    /// Write requests per backend batch.
    pub batch_write_limit: usize,

    /// Pause before each prune deletion batch.
    #[serde(with = "humantime_compat")]
    pub background_sleep: Duration,

    /// Interval between table status polls.
    #[serde(with = "humantime_compat")]
    pub table_poll_interval: Duration,

    /// Status polls before waiting for a table gives up.
    pub table_wait_max_polls: u32,

    /// Throttle events after which throttle warnings are logged at debug.
    pub throttle_log_limit: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            region: String::new(),
            owner: String::new(),
            create_table: false,
            read_capacity: 500,
            write_capacity: 100,
            max_retries: 9,
            min_retry_sleep: Duration::from_millis(100),
            max_retry_sleep: Duration::from_secs(60),
            batch_write_limit: MAX_BATCH_WRITE_ITEMS,
            background_sleep: Duration::from_millis(25),
            table_poll_interval: Duration::from_secs(2),
            table_wait_max_polls: 150,
            throttle_log_limit: 100,
        }
    }
}

impl StoreConfig {
    /// Convenience constructor with the two required fields.
    pub fn new(table_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let config: StoreConfig = toml::from_str(content)
            .map_err(|e| StoreError::invalid(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::invalid(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Store config loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(StoreError::invalid("No table name configured"));
        }
        if self.region.trim().is_empty() {
            return Err(StoreError::invalid("No region configured"));
        }
        if self.batch_write_limit == 0 || self.batch_write_limit > MAX_BATCH_WRITE_ITEMS {
            return Err(StoreError::invalid(format!(
                "batch_write_limit must be between 1 and {}, got {}",
                MAX_BATCH_WRITE_ITEMS, self.batch_write_limit
            )));
        }
        if self.read_capacity <= 0 || self.write_capacity <= 0 {
            return Err(StoreError::invalid("table capacity must be positive"));
        }
        if self.min_retry_sleep > self.max_retry_sleep {
            return Err(StoreError::invalid(
                "min_retry_sleep must not exceed max_retry_sleep",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Duration serialisation helper (seconds-based)
// ---------------------------------------------------------------------------

/// Serde helper that serialises `Duration` as floating-point seconds.
mod humantime_compat {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration: {} seconds: {}", secs, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.max_retries, 9);
        assert_eq!(cfg.min_retry_sleep, Duration::from_millis(100));
        assert_eq!(cfg.batch_write_limit, 25);
        assert_eq!(cfg.background_sleep, Duration::from_millis(25));
        assert!(!cfg.create_table);
        // Table name and region are mandatory.
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(StoreConfig::new("t", "r").validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let cfg = StoreConfig::from_toml_str(
            r#"
            table_name = "meta"
            region = "eu-west-1"
            create_table = true
            max_retries = 3
            min_retry_sleep = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.table_name, "meta");
        assert!(cfg.create_table);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.min_retry_sleep, Duration::from_millis(500));
        assert_eq!(cfg.write_capacity, 100);
    }

    #[test]
    fn test_validation_errors() {
        let mut cfg = StoreConfig::new("t", "r");
        cfg.batch_write_limit = 26;
        assert!(cfg.validate().is_err());

        let mut cfg = StoreConfig::new("t", "r");
        cfg.read_capacity = 0;
        assert!(cfg.validate().is_err());

        assert!(StoreConfig::from_toml_str("table_name = \"t\"").is_err());
        assert!(StoreConfig::from_toml_str("table_name = 3").is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for value in ["1e30", "-1.0", "nan", "inf"] {
            let toml = format!(
                "table_name = \"t\"\nregion = \"r\"\nmax_retry_sleep = {}\n",
                value
            );
            let err = StoreConfig::from_toml_str(&toml).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", value);
        }
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "table_name = \"meta\"\nregion = \"local\"\n").unwrap();
        let cfg = StoreConfig::load(&path).unwrap();
        assert_eq!(cfg.region, "local");

        assert!(StoreConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = StoreConfig::new("meta", "local");
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.table_name, cfg.table_name);
        assert_eq!(parsed.table_poll_interval, cfg.table_poll_interval);
        assert_eq!(parsed.max_retry_sleep, cfg.max_retry_sleep);
    }
}
