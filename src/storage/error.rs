//! Storage collaborator error types
//!
//! Everything the storage provider and its row handles can fail with.
//! We use `thiserror` for the error definitions.

use thiserror::Error;

use crate::storage::types::{InvalidNameError, RowKey, TableName};

/// the error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested row was not found
    #[error("row not found: table={table}, key={key}")]
    RowNotFound { table: TableName, key: RowKey },

    /// the requested table was not found
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    /// the row already exists (duplicate primary key)
    #[error("row already exists: table={table}, key={key}")]
    RowAlreadyExists { table: TableName, key: RowKey },

    /// the table already exists
    #[error("table already exists: {0}")]
    TableAlreadyExists(TableName),

    /// invalid table or row name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// a write was attempted through a read-only handle
    #[error("handle {handle} is read-only")]
    ReadOnly { handle: String },

    /// the handle was already committed or rolled back
    #[error("handle {0} is closed")]
    HandleClosed(String),

    /// the provider could not open a new boundary
    #[error("failed to begin storage transaction: {0}")]
    BeginFailed(String),

    /// row data is not a JSON object
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RowNotFound { .. } | StorageError::TableNotFound(_)
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::RowAlreadyExists { .. } | StorageError::TableAlreadyExists(_)
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
