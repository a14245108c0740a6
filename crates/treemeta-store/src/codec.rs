//! Translation between store paths/metadata and backing-table items.
//!
//! A path `s3a://bucket/a/b/c` is stored under partition key `/bucket/a/b`
//! and range key `c`. The bucket acts as the root directory, so several
//! buckets can share one table. The root itself has a parent key (used to
//! list its children) but no item key: it is never persisted.

use treemeta_kv::{AttributeValue, Filter, Item, PrimaryKey};

use crate::error::{StoreError, StoreResult};
use crate::metadata::PathMetadata;
use crate::path::StorePath;

pub const IS_DIR: &str = "is_dir";
pub const MOD_TIME: &str = "mod_time";
pub const LENGTH: &str = "length";
pub const BLOCK_SIZE: &str = "block_size";
pub const IS_DELETED: &str = "is_deleted";

/// Parent and child key of the version marker. Lies outside the path key
/// space because it does not start with `/`.
pub const VERSION_MARKER: &str = "../VERSION";
pub const SCHEMA_VERSION: &str = "schema_version";
pub const CREATED_AT: &str = "created_at";

/// Partition key under which the children of `path` are stored.
pub fn path_to_parent_key(path: &StorePath) -> String {
    let mut key = String::with_capacity(64);
    key.push('/');
    key.push_str(path.bucket());
    for segment in path.segments() {
        key.push('/');
        key.push_str(segment);
    }
    key
}

/// Item key of a non-root path.
pub fn path_to_key(path: &StorePath) -> StoreResult<PrimaryKey> {
    match path.parent() {
        Some(parent) => Ok(PrimaryKey::new(
            path_to_parent_key(&parent),
            path.name(),
        )),
        None => Err(StoreError::invalid(format!(
            "root path {} has no item key",
            path
        ))),
    }
}

/// Inverse of [`path_to_key`]. `None` for keys outside the path key space.
pub fn key_to_path(key: &PrimaryKey) -> Option<StorePath> {
    let parent = key.parent.strip_prefix('/')?;
    let mut parts = parent.split('/');
    let bucket = parts.next().filter(|b| !b.is_empty())?;
    if key.child.is_empty() || key.child.contains('/') {
        return None;
    }
    let path = StorePath::from_parts(bucket, parts).child(&key.child).ok()?;
    Some(path)
}

pub fn path_metadata_to_item(meta: &PathMetadata) -> StoreResult<Item> {
    let mut item = Item::new(path_to_key(&meta.path)?);
    if meta.is_dir {
        item = item.with_bool(IS_DIR, true);
    } else {
        item = item
            .with_long(LENGTH, meta.length)
            .with_long(MOD_TIME, meta.modification_time)
            .with_long(BLOCK_SIZE, meta.block_size);
    }
    Ok(item.with_bool(IS_DELETED, meta.is_deleted))
}

pub fn path_metadata_to_items<'a>(
    metas: impl IntoIterator<Item = &'a PathMetadata>,
) -> StoreResult<Vec<Item>> {
    metas.into_iter().map(path_metadata_to_item).collect()
}

/// Rebuild metadata from an item, stamping `owner` on it.
///
/// Returns `None` for the version marker and other items whose key does not
/// decode to a path.
pub fn item_to_path_metadata(item: &Item, owner: &str) -> Option<PathMetadata> {
    let Some(path) = key_to_path(&item.key) else {
        if item.key.parent != VERSION_MARKER {
            tracing::warn!(key = %item.key, "item key does not decode to a path");
        }
        return None;
    };
    let is_dir = item.get_bool(IS_DIR).unwrap_or(false);
    let mut meta = if is_dir {
        PathMetadata::directory(path, owner)
    } else {
        PathMetadata::file(
            path,
            item.get_long(LENGTH).unwrap_or(0),
            item.get_long(MOD_TIME).unwrap_or(0),
            item.get_long(BLOCK_SIZE).unwrap_or(0),
            owner,
        )
    };
    meta.is_deleted = item.get_bool(IS_DELETED).unwrap_or(false);
    Some(meta)
}

/// Whether an item is present and not tombstoned.
pub fn item_exists(item: Option<&Item>) -> bool {
    match item {
        Some(item) => !item.get_bool(IS_DELETED).unwrap_or(false),
        None => false,
    }
}

/// Query filter selecting non-tombstoned items.
pub fn live_items_filter() -> Filter {
    Filter::Equals(IS_DELETED.to_string(), AttributeValue::Bool(false))
}

/// Scan filter selecting items modified strictly before `mod_time`.
///
/// Directories carry no modification time and never match.
pub fn expired_items_filter(mod_time: i64) -> Filter {
    Filter::LessThan(MOD_TIME.to_string(), mod_time)
}

pub fn version_marker_key() -> PrimaryKey {
    PrimaryKey::new(VERSION_MARKER, VERSION_MARKER)
}

pub fn create_version_marker(version: i64, created_at: i64) -> Item {
    Item::new(version_marker_key())
        .with_long(SCHEMA_VERSION, version)
        .with_long(CREATED_AT, created_at)
}

pub fn extract_version_from_marker(marker: &Item) -> StoreResult<i64> {
    marker.get_long(SCHEMA_VERSION).ok_or_else(|| {
        StoreError::invalid(format!(
            "version marker {} has no {} attribute",
            marker.key, SCHEMA_VERSION
        ))
    })
}

pub fn extract_creation_time_from_marker(marker: &Item) -> Option<i64> {
    marker.get_long(CREATED_AT)
}
