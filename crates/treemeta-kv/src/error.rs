//! Backend error types.

/// Errors reported by a backing table client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The table (or another named resource) does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The resource is already being created or modified.
    #[error("resource in use: {0}")]
    ResourceInUse(String),

    /// The request exceeded provisioned throughput.
    #[error("provisioned throughput exceeded: {0}")]
    Throttled(String),

    /// The request was malformed (oversized batch, duplicate keys, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// The service failed the request.
    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },

    /// The request never reached the service or the response was lost.
    #[error("network error: {0}")]
    Network(String),
}

impl TableError {
    /// Whether the backend rejected the request because of rate limits.
    pub fn is_throttle(&self) -> bool {
        matches!(self, TableError::Throttled(_))
    }

    /// Whether the error reflects a caller bug or a permanent table state
    /// that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TableError::ResourceNotFound(_)
                | TableError::ResourceInUse(_)
                | TableError::Validation(_)
        )
    }
}

/// Convenience result type.
pub type TableResult<T> = std::result::Result<T, TableError>;
