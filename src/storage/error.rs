//! Storage Engine Error Types

use thiserror::Error;

use crate::concurrency::PreconditionError;

/// Storage engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists (names compare case-insensitively)
    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    /// Configured table limit reached
    #[error("Table limit reached ({0})")]
    TableLimitReached(usize),

    /// Entity not found
    #[error("Entity not found: ({0}, {1})")]
    EntityNotFound(String, String),

    /// Entity already exists
    #[error("Entity already exists: ({0}, {1})")]
    EntityAlreadyExists(String, String),

    /// If-Match precondition not satisfied
    #[error("Precondition failed for ({0}, {1})")]
    PreconditionFailed(String, String),

    /// Invalid query expression
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// A transaction mutation failed; nothing was applied
    #[error("Transaction aborted at operation {index}: {source}")]
    TransactionAborted {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub(crate) fn from_precondition(err: PreconditionError, pk: &str, rk: &str) -> Self {
        match err {
            PreconditionError::Failed => {
                StorageError::PreconditionFailed(pk.to_string(), rk.to_string())
            }
            PreconditionError::NotFound => {
                StorageError::EntityNotFound(pk.to_string(), rk.to_string())
            }
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
