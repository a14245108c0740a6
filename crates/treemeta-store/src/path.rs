//! Absolute store paths of the form `s3a://bucket/dir/file`.
//!
//! The bucket is the storage root. Paths are normalized on parse: empty and
//! `.` segments are dropped and `..` pops a segment, never escaping the
//! bucket root.

use std::fmt;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};

/// URI scheme accepted for store paths.
pub const SCHEME: &str = "s3a";

/// A normalized absolute path inside one bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    bucket: String,
    segments: Vec<String>,
}

impl StorePath {
    /// Parse `s3a://bucket/a/b`.
    pub fn parse(s: &str) -> StoreResult<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StoreError::invalid(format!("Path {} is not absolute", s)))?;
        if scheme.is_empty() {
            return Err(StoreError::invalid(format!("Path {} missing scheme", s)));
        }
        if scheme != SCHEME {
            return Err(StoreError::invalid(format!(
                "Path {} scheme must be {}",
                s, SCHEME
            )));
        }
        let (bucket, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(StoreError::invalid(format!("Path {} is missing bucket.", s)));
        }
        Ok(Self::from_parts(bucket, path.split('/')))
    }

    /// The root of `bucket`. The bucket must be non-empty and free of `/`.
    pub fn root(bucket: impl Into<String>) -> StoreResult<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains('/') {
            return Err(StoreError::invalid(format!(
                "Invalid bucket name {:?}",
                bucket
            )));
        }
        Ok(Self {
            bucket,
            segments: Vec::new(),
        })
    }

    pub(crate) fn from_parts<'a>(
        bucket: &str,
        parts: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut segments: Vec<String> = Vec::new();
        for part in parts {
            match part {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                p => segments.push(p.to_string()),
            }
        }
        Self {
            bucket: bucket.to_string(),
            segments,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments below the bucket root.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Final segment; empty for the root.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// The parent path, `None` for the root.
    pub fn parent(&self) -> Option<StorePath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            bucket: self.bucket.clone(),
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The entry `name` directly below `self`. `name` must be a single
    /// segment.
    pub fn child(&self, name: &str) -> StoreResult<StorePath> {
        if matches!(name, "" | "." | "..") || name.contains('/') {
            return Err(StoreError::invalid(format!(
                "Invalid child name {:?} under {}",
                name, self
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self {
            bucket: self.bucket.clone(),
            segments,
        })
    }

    /// Whether `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &StorePath) -> bool {
        self.bucket == other.bucket && self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", SCHEME, self.bucket, self.segments.join("/"))
    }
}

impl FromStr for StorePath {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::parse(s)
    }
}
