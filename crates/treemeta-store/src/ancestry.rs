//! Ancestor completion.
//!
//! The table cannot enforce that a live path has live ancestors, so every
//! write set is expanded with directory entries for the ancestors it needs.
//! The bucket root is never persisted and therefore never synthesized.

use std::collections::HashMap;

use treemeta_kv::{PrimaryKey, TableClient, TableResult};

use crate::codec::{self, item_exists};
use crate::error::StoreResult;
use crate::metadata::{PathMetadata, Tristate};
use crate::path::StorePath;

/// Directory entry standing in for a missing ancestor.
pub fn synthesized_directory(path: StorePath, owner: &str) -> PathMetadata {
    PathMetadata::directory(path, owner).with_empty_directory(Tristate::False)
}

/// Expand `metas` with a directory entry for every ancestor not already in
/// the set, without consulting the table.
///
/// The walk up from each input stops at the first ancestor already
/// accumulated, so shared ancestors are synthesized once. An explicit input
/// always replaces a synthesized entry for the same path, and a later input
/// replaces an earlier one. Root inputs are dropped. The result is ordered by
/// ascending depth, so ancestors precede their descendants.
pub fn complete_ancestry(
    metas: impl IntoIterator<Item = PathMetadata>,
    owner: &str,
) -> Vec<PathMetadata> {
    let mut ancestry: HashMap<StorePath, PathMetadata> = HashMap::new();
    for meta in metas {
        if meta.path.is_root() {
            continue;
        }
        let mut parent = meta.path.parent();
        ancestry.insert(meta.path.clone(), meta);
        while let Some(path) = parent {
            if path.is_root() || ancestry.contains_key(&path) {
                break;
            }
            parent = path.parent();
            ancestry.insert(path.clone(), synthesized_directory(path, owner));
        }
    }

    let mut completed: Vec<PathMetadata> = ancestry.into_values().collect();
    completed.sort_by(|a, b| {
        a.path
            .depth()
            .cmp(&b.path.depth())
            .then_with(|| a.path.cmp(&b.path))
    });
    completed
}

/// Non-root ancestors of `path` with their item keys, nearest first.
pub fn ancestor_keys(path: &StorePath) -> StoreResult<Vec<(StorePath, PrimaryKey)>> {
    let mut ancestors = Vec::new();
    let mut parent = path.parent();
    while let Some(p) = parent {
        if p.is_root() {
            break;
        }
        let key = codec::path_to_key(&p)?;
        parent = p.parent();
        ancestors.push((p, key));
    }
    Ok(ancestors)
}

/// `meta` plus a directory entry for each missing ancestor, confirmed
/// against the table.
///
/// Each ancestor in `ancestors` (as produced by [`ancestor_keys`]) is read
/// with a strongly consistent get; the walk stops at the first one that is
/// present and not tombstoned. The result is ordered ancestors first.
pub async fn full_paths_to_put(
    client: &dyn TableClient,
    table: &str,
    meta: &PathMetadata,
    ancestors: &[(StorePath, PrimaryKey)],
    owner: &str,
) -> TableResult<Vec<PathMetadata>> {
    let mut metas = Vec::with_capacity(ancestors.len() + 1);
    if !meta.path.is_root() {
        metas.push(meta.clone());
    }
    for (path, key) in ancestors {
        let item = client.get_item(table, key, true).await?;
        if item_exists(item.as_ref()) {
            break;
        }
        metas.push(synthesized_directory(path.clone(), owner));
    }
    metas.reverse();
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use treemeta_kv::ProvisionedThroughput;
    use treemeta_kv_backends::MemTableClient;

    use super::*;
    use crate::codec::path_metadata_to_item;

    fn path(s: &str) -> StorePath {
        StorePath::parse(s).unwrap()
    }

    fn file(s: &str) -> PathMetadata {
        PathMetadata::file(path(s), 111, 100, 0, "alice")
    }

    fn paths(metas: &[PathMetadata]) -> Vec<String> {
        metas.iter().map(|m| m.path.to_string()).collect()
    }

    #[test]
    fn test_complete_ancestry_synthesizes_missing_dirs() {
        let completed = complete_ancestry(vec![file("s3a://b/dir1/dir2/file1")], "alice");
        assert_eq!(
            paths(&completed),
            vec!["s3a://b/dir1", "s3a://b/dir1/dir2", "s3a://b/dir1/dir2/file1"]
        );
        for dir in &completed[..2] {
            assert!(dir.is_dir && dir.is_live());
            assert_eq!(dir.is_empty_directory, Tristate::False);
            assert_eq!(dir.owner, "alice");
        }
        assert_eq!(completed[2].length, 111);
    }

    #[test]
    fn test_complete_ancestry_shares_ancestors() {
        let completed = complete_ancestry(
            vec![file("s3a://b/d/x"), file("s3a://b/d/y"), file("s3a://b/e")],
            "",
        );
        assert_eq!(
            paths(&completed),
            vec!["s3a://b/d", "s3a://b/e", "s3a://b/d/x", "s3a://b/d/y"]
        );
    }

    #[test]
    fn test_explicit_entry_replaces_synthesized() {
        let explicit_dir = PathMetadata::directory(path("s3a://b/d"), "bob");
        let completed = complete_ancestry(vec![file("s3a://b/d/x"), explicit_dir.clone()], "");
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0], explicit_dir);
    }

    #[test]
    fn test_root_is_never_synthesized() {
        let completed = complete_ancestry(
            vec![
                PathMetadata::directory(StorePath::root("b").unwrap(), ""),
                file("s3a://b/top"),
            ],
            "",
        );
        assert_eq!(paths(&completed), vec!["s3a://b/top"]);
    }

    #[test]
    fn test_ancestor_keys() {
        let ancestors = ancestor_keys(&path("s3a://b/a/b/c")).unwrap();
        let keys: Vec<_> = ancestors.iter().map(|(_, k)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![PrimaryKey::new("/b/a", "b"), PrimaryKey::new("/b", "a")]
        );
        assert!(ancestor_keys(&path("s3a://b/top")).unwrap().is_empty());
        assert!(ancestor_keys(&StorePath::root("b").unwrap()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_paths_to_put_stops_at_live_ancestor() {
        let client = MemTableClient::new("local");
        client.create_active_table(
            "meta",
            ProvisionedThroughput {
                read_capacity_units: 10,
                write_capacity_units: 10,
            },
        );
        let existing = PathMetadata::directory(path("s3a://b/a"), "");
        client.put_raw("meta", path_metadata_to_item(&existing).unwrap());

        let meta = file("s3a://b/a/b/c/f");
        let ancestors = ancestor_keys(&meta.path).unwrap();
        let metas = full_paths_to_put(&client, "meta", &meta, &ancestors, "alice")
            .await
            .unwrap();
        assert_eq!(
            paths(&metas),
            vec!["s3a://b/a/b", "s3a://b/a/b/c", "s3a://b/a/b/c/f"]
        );
        // Reads /b/a/b/c, /b/a/b, then stops at /b/a.
        assert_eq!(client.stats().get_item, 3);
    }

    #[tokio::test]
    async fn test_full_paths_to_put_skips_tombstoned_ancestor() {
        let client = MemTableClient::new("local");
        client.create_active_table(
            "meta",
            ProvisionedThroughput {
                read_capacity_units: 10,
                write_capacity_units: 10,
            },
        );
        let gone = PathMetadata::tombstone(path("s3a://b/a"), 1);
        client.put_raw("meta", path_metadata_to_item(&gone).unwrap());

        let meta = file("s3a://b/a/f");
        let ancestors = ancestor_keys(&meta.path).unwrap();
        let metas = full_paths_to_put(&client, "meta", &meta, &ancestors, "")
            .await
            .unwrap();
        assert_eq!(paths(&metas), vec!["s3a://b/a", "s3a://b/a/f"]);
        assert!(metas[0].is_dir && metas[0].is_live());
    }
}
