//! Error taxonomy of the table service.
//!
//! Every variant maps to a fixed HTTP status and an OData error code, and renders
//! as `{"odata.error":{"code":..,"message":{"lang":"en-US","value":..}}}`.

use axum::http::StatusCode;
use serde_json::json;

use crate::entity::{NormalizeError, Timestamp};
use crate::storage::StorageError;

/// Table service error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    // Request Errors
    /// Malformed entity JSON, batch envelope, query option or name
    #[error("{message}")]
    InvalidInput { message: String },

    /// Missing PartitionKey/RowKey or body
    #[error("The values are not specified for all properties in the entity: {field}")]
    PropertiesNeedValue { field: String },

    #[error("The table name is empty")]
    TableNameEmpty,

    #[error("The account name is empty")]
    AccountNameEmpty,

    /// Unsupported `Accept` / `$format`
    #[error("Atom format is not supported: {accept}")]
    AtomFormatNotSupported { accept: String },

    /// Verb not supported by the addressed resource
    #[error("The requested method {method} is not allowed on {resource}")]
    MethodNotAllowed { method: String, resource: String },

    #[error("{feature} is not implemented")]
    NotImplemented { feature: String },

    // Resource Errors
    #[error("The table specified does not exist: {table}")]
    TableNotFound { table: String },

    #[error("The table specified already exists: {table}")]
    TableAlreadyExists { table: String },

    #[error("The specified entity does not exist")]
    EntityNotFound,

    #[error("The specified entity already exists")]
    EntityAlreadyExists,

    /// ETag mismatch or empty `If-Match`
    #[error("The update condition specified in the request was not satisfied")]
    PreconditionFailed,

    // Batch Errors
    #[error("All commands in a batch must operate on the same entity group")]
    MultiplePartitionKeysInBatch,

    #[error("The batch request operation exceeds the maximum {limit} changes per change set")]
    TooManyOperationsInBatch { limit: usize },

    // Server Errors
    #[error("Table limit reached ({limit})")]
    TableLimitReached { limit: usize },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type for table service operations
pub type TableResult<T> = Result<T, TableError>;

impl TableError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        TableError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TableError::InvalidInput { .. }
            | TableError::PropertiesNeedValue { .. }
            | TableError::TableNameEmpty
            | TableError::AccountNameEmpty
            | TableError::AtomFormatNotSupported { .. }
            | TableError::MultiplePartitionKeysInBatch
            | TableError::TooManyOperationsInBatch { .. } => StatusCode::BAD_REQUEST,
            TableError::TableNotFound { .. } | TableError::EntityNotFound => {
                StatusCode::NOT_FOUND
            }
            TableError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            TableError::TableAlreadyExists { .. } | TableError::EntityAlreadyExists => {
                StatusCode::CONFLICT
            }
            TableError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            TableError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            TableError::TableLimitReached { .. } => StatusCode::FORBIDDEN,
            TableError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OData error code
    pub fn code(&self) -> &'static str {
        match self {
            TableError::InvalidInput { .. } => "InvalidInput",
            TableError::PropertiesNeedValue { .. } => "PropertiesNeedValue",
            TableError::TableNameEmpty => "TableNameEmpty",
            TableError::AccountNameEmpty => "AccountNameEmpty",
            TableError::AtomFormatNotSupported { .. } => "AtomFormatNotSupported",
            TableError::MethodNotAllowed { .. } => "MethodNotAllowed",
            TableError::NotImplemented { .. } => "NotImplemented",
            TableError::TableNotFound { .. } => "TableNotFound",
            TableError::TableAlreadyExists { .. } => "TableAlreadyExists",
            TableError::EntityNotFound => "ResourceNotFound",
            TableError::EntityAlreadyExists => "EntityAlreadyExists",
            TableError::PreconditionFailed => "UpdateConditionNotSatisfied",
            TableError::MultiplePartitionKeysInBatch => "CommandsInBatchActOnDifferentPartitions",
            TableError::TooManyOperationsInBatch { .. } => "InvalidInput",
            TableError::TableLimitReached { .. } => "TableLimitReached",
            TableError::Internal { .. } => "InternalError",
        }
    }

    /// OData error body. `index` prefixes the message with the failing batch
    /// sub-request (`"0:..."`).
    pub fn odata_body(&self, request_id: &str, index: Option<usize>) -> serde_json::Value {
        let prefix = index.map(|i| format!("{i}:")).unwrap_or_default();
        let value = format!(
            "{prefix}{self}\nRequestId:{request_id}\nTime:{}",
            Timestamp::now()
        );
        json!({
            "odata.error": {
                "code": self.code(),
                "message": {
                    "lang": "en-US",
                    "value": value,
                }
            }
        })
    }
}

impl From<NormalizeError> for TableError {
    fn from(e: NormalizeError) -> Self {
        match e {
            NormalizeError::MissingKey(field) => TableError::PropertiesNeedValue {
                field: field.to_string(),
            },
            NormalizeError::InvalidProperty { .. } => TableError::InvalidInput {
                message: e.to_string(),
            },
        }
    }
}

// Conversions from storage errors
impl From<StorageError> for TableError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::TableNotFound(table) => TableError::TableNotFound { table },
            StorageError::TableAlreadyExists(table) => TableError::TableAlreadyExists { table },
            StorageError::TableLimitReached(limit) => TableError::TableLimitReached { limit },
            StorageError::EntityNotFound(_, _) => TableError::EntityNotFound,
            StorageError::EntityAlreadyExists(_, _) => TableError::EntityAlreadyExists,
            StorageError::PreconditionFailed(_, _) => TableError::PreconditionFailed,
            StorageError::InvalidFilter(message) => TableError::InvalidInput { message },
            StorageError::TransactionAborted { source, .. } => TableError::from(*source),
        }
    }
}
