//! In-memory metadata types handed to and returned from the store.

use crate::path::StorePath;

/// Three-valued flag used for the empty-directory hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    True,
    False,
    /// Not determined by a listing query.
    #[default]
    Unknown,
}

impl Tristate {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

/// Metadata for one file or directory.
///
/// `modification_time`, `length` and `block_size` are meaningful only for
/// files; directories carry zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    pub path: StorePath,
    pub is_dir: bool,
    pub is_deleted: bool,
    /// Milliseconds since the Unix epoch.
    pub modification_time: i64,
    pub length: i64,
    pub block_size: i64,
    pub owner: String,
    pub is_empty_directory: Tristate,
}

impl PathMetadata {
    pub fn file(
        path: StorePath,
        length: i64,
        modification_time: i64,
        block_size: i64,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            path,
            is_dir: false,
            is_deleted: false,
            modification_time,
            length,
            block_size,
            owner: owner.into(),
            is_empty_directory: Tristate::Unknown,
        }
    }

    pub fn directory(path: StorePath, owner: impl Into<String>) -> Self {
        Self {
            path,
            is_dir: true,
            is_deleted: false,
            modification_time: 0,
            length: 0,
            block_size: 0,
            owner: owner.into(),
            is_empty_directory: Tristate::Unknown,
        }
    }

    /// A file-shaped deletion marker stamped with `now_ms`.
    pub fn tombstone(path: StorePath, now_ms: i64) -> Self {
        Self {
            path,
            is_dir: false,
            is_deleted: true,
            modification_time: now_ms,
            length: 0,
            block_size: 0,
            owner: String::new(),
            is_empty_directory: Tristate::Unknown,
        }
    }

    pub fn with_empty_directory(mut self, state: Tristate) -> Self {
        self.is_empty_directory = state;
        self
    }

    /// Present and not tombstoned.
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

/// The direct children of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub path: StorePath,
    /// Children in range-key order.
    pub listing: Vec<PathMetadata>,
    /// Whether the listing is known to be complete.
    pub authoritative: bool,
}

impl DirListing {
    pub fn new(path: StorePath, listing: Vec<PathMetadata>, authoritative: bool) -> Self {
        Self {
            path,
            listing,
            authoritative,
        }
    }

    /// Emptiness of the directory as far as this listing can tell.
    ///
    /// Only an authoritative listing can prove a directory empty.
    pub fn is_empty(&self) -> Tristate {
        if self.listing.iter().any(PathMetadata::is_live) {
            Tristate::False
        } else if self.authoritative {
            Tristate::True
        } else {
            Tristate::Unknown
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.listing.iter().map(|m| m.path.name()).collect()
    }
}
