//! Breadth-first traversal of a subtree through the store's own listings.

use std::collections::VecDeque;

use crate::error::StoreResult;
use crate::metadata::PathMetadata;
use crate::store::MetadataStore;

/// Pull-based breadth-first walk starting at a subtree root.
///
/// Directories are expanded with [`MetadataStore::list_children`];
/// tombstoned children are skipped and never expanded. The root itself is
/// yielded first, whatever its state.
pub struct Descendants<'a> {
    store: &'a dyn MetadataStore,
    queue: VecDeque<PathMetadata>,
}

impl<'a> Descendants<'a> {
    pub fn new(store: &'a dyn MetadataStore, root: PathMetadata) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(root);
        Self { store, queue }
    }

    /// The next entry in breadth-first order, or `None` when the walk is done.
    pub async fn next(&mut self) -> StoreResult<Option<PathMetadata>> {
        let Some(meta) = self.queue.pop_front() else {
            return Ok(None);
        };
        if meta.is_dir {
            if let Some(listing) = self.store.list_children(&meta.path).await? {
                self.queue
                    .extend(listing.listing.into_iter().filter(PathMetadata::is_live));
            }
        }
        Ok(Some(meta))
    }

    /// Drain the walk into a snapshot.
    pub async fn collect(mut self) -> StoreResult<Vec<PathMetadata>> {
        let mut all = Vec::new();
        while let Some(meta) = self.next().await? {
            all.push(meta);
        }
        Ok(all)
    }
}
