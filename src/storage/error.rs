//! Storage error taxonomy.

use std::time::Duration;

use super::SnapshotId;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No current snapshot: collection={collection}, id={id}")]
    NotFound { collection: String, id: String },

    #[error("Stale snapshot: collection={collection}, id={id}, expected current={expected}")]
    Conflict {
        collection: String,
        id: String,
        expected: SnapshotId,
    },

    #[error("Entity already exists: collection={collection}, id={id}")]
    Integrity { collection: String, id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("Transaction opened inside another transaction")]
    NestedTransaction,

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Query build error: {0}")]
    Query(#[from] sea_query::error::Error),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("Cursor is not positioned on a snapshot")]
    NoCurrentRow,
}

/// Coarse error classes exposed to upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Integrity,
    Transport,
    Serialization,
}

impl ErrorKind {
    /// HTTP status an upper layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Integrity => 400,
            ErrorKind::Transport | ErrorKind::Serialization => 500,
        }
    }
}

impl StoreError {
    /// Classify this error.
    ///
    /// Misuse of the API (closed or nested transactions, bad collection
    /// names, malformed statements) counts as `Transport`: nothing the end
    /// user sent can fix it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Integrity { .. } => ErrorKind::Integrity,
            StoreError::Serialization(_) => ErrorKind::Serialization,
            StoreError::Database(_)
            | StoreError::Timeout(_)
            | StoreError::TransactionClosed
            | StoreError::NestedTransaction
            | StoreError::Query(_)
            | StoreError::InvalidCollectionName(_)
            | StoreError::NoCurrentRow => ErrorKind::Transport,
        }
    }

    /// True when a retry-with-refetch loop should try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn integrity(collection: &str, id: &str) -> Self {
        StoreError::Integrity {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(collection: &str, id: &str, expected: SnapshotId) -> Self {
        StoreError::Conflict {
            collection: collection.to_string(),
            id: id.to_string(),
            expected,
        }
    }
}
