//! Store error types.

use treemeta_kv::TableError;

/// Message prefix used when a table lacks its version marker.
pub const E_NO_VERSION_MARKER: &str = "Metadata table lacks version marker.";

/// Message prefix used when a table's version marker does not match.
pub const E_INCOMPATIBLE_VERSION: &str =
    "Database table is from an incompatible metadata store version.";

/// Closed classification of every error the store can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Table or version marker missing.
    NotFound,
    /// Version marker present with the wrong schema version.
    IncompatibleVersion,
    /// Table being deleted, stuck in a transitional state, or in an
    /// unrecognized state.
    TableUnavailable,
    /// Rate limited beyond the retry budget.
    Throttled,
    /// Cancelled while waiting.
    Interrupted,
    /// Any other backend failure.
    BackendFault,
    /// Bad path, metadata or configuration supplied by the caller.
    InvalidArgument,
}

/// Errors surfaced by the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The table does not exist and may not be created.
    #[error("table '{table}' does not exist in region {region}: {reason}")]
    TableNotFound {
        table: String,
        region: String,
        reason: String,
    },

    /// The table exists but has no version marker.
    #[error("{} Table: {table}", E_NO_VERSION_MARKER)]
    NoVersionMarker { table: String },

    /// The version marker holds an unexpected schema version.
    #[error("{} Table {table} Expected version {expected} actual {actual}", E_INCOMPATIBLE_VERSION)]
    IncompatibleVersion {
        table: String,
        expected: i64,
        actual: i64,
    },

    /// The table cannot be used in its current state.
    #[error("table '{table}' in region {region} is unavailable: {reason}")]
    TableUnavailable {
        table: String,
        region: String,
        reason: String,
    },

    /// A backend call failed and was not (or could no longer be) retried.
    #[error("{operation} on {target} (table '{table}', region {region}): {source}")]
    Backend {
        operation: String,
        target: String,
        table: String,
        region: String,
        #[source]
        source: TableError,
    },

    /// The retry budget ran out.
    #[error(
        "max retries exceeded ({attempts}) for {operation} on {target} \
         (table '{table}', region {region}): {message}"
    )]
    RetryExhausted {
        operation: String,
        target: String,
        table: String,
        region: String,
        attempts: u32,
        throttled: bool,
        message: String,
    },

    /// A wait was cancelled by store shutdown.
    #[error("{operation} on {target} interrupted (table '{table}', region {region})")]
    Interrupted {
        operation: String,
        target: String,
        table: String,
        region: String,
    },

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::TableNotFound { .. } | StoreError::NoVersionMarker { .. } => {
                ErrorKind::NotFound
            }
            StoreError::IncompatibleVersion { .. } => ErrorKind::IncompatibleVersion,
            StoreError::TableUnavailable { .. } => ErrorKind::TableUnavailable,
            StoreError::Backend { source, .. } => match source {
                TableError::ResourceNotFound(_) => ErrorKind::NotFound,
                TableError::Throttled(_) => ErrorKind::Throttled,
                _ => ErrorKind::BackendFault,
            },
            StoreError::RetryExhausted { throttled, .. } => {
                if *throttled {
                    ErrorKind::Throttled
                } else {
                    ErrorKind::BackendFault
                }
            }
            StoreError::Interrupted { .. } => ErrorKind::Interrupted,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }
}

/// Convenience result type.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_follows_source() {
        let err = |source| StoreError::Backend {
            operation: "get".into(),
            target: "s3a://b/x".into(),
            table: "t".into(),
            region: "r".into(),
            source,
        };
        assert_eq!(
            err(TableError::ResourceNotFound("t".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            err(TableError::Throttled("slow down".into())).kind(),
            ErrorKind::Throttled
        );
        assert_eq!(
            err(TableError::Network("reset".into())).kind(),
            ErrorKind::BackendFault
        );
    }

    #[test]
    fn test_messages_carry_context() {
        let e = StoreError::IncompatibleVersion {
            table: "meta".into(),
            expected: 100,
            actual: 99,
        };
        let msg = e.to_string();
        assert!(msg.starts_with(E_INCOMPATIBLE_VERSION));
        assert!(msg.contains("Expected version 100 actual 99"));

        let e = StoreError::RetryExhausted {
            operation: "put".into(),
            target: "s3a://b/x".into(),
            table: "meta".into(),
            region: "eu-west-1".into(),
            attempts: 4,
            throttled: true,
            message: "throttled".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Throttled);
        let msg = e.to_string();
        assert!(msg.contains("s3a://b/x"));
        assert!(msg.contains("meta"));
        assert!(msg.contains("eu-west-1"));
    }

    #[test]
    fn test_no_marker_is_not_found() {
        let e = StoreError::NoVersionMarker { table: "meta".into() };
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), format!("{} Table: meta", E_NO_VERSION_MARKER));
    }
}
