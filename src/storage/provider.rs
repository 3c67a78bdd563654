//! The seams between the coordinator and whatever store sits underneath.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::storage::error::StorageResult;
use crate::storage::row::Row;
use crate::storage::types::{RowKey, TableName};
use crate::transaction::IsolationLevel;

/// A store that can open, commit and roll back atomic boundaries.
///
/// The handle returned by [`begin`](StorageProvider::begin) is opaque to the
/// coordinator; it is cloned into every context and operation of the
/// boundary.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Open a boundary with the requested isolation level.
    async fn begin(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> StorageResult<Self::Handle>;

    /// Make the boundary's writes permanent and close the handle.
    async fn commit(&self, handle: &Self::Handle) -> StorageResult<()>;

    /// Abandon the boundary and close the handle.
    async fn rollback(&self, handle: &Self::Handle) -> StorageResult<()>;
}

/// Row-level access through a storage handle.
///
/// Required by the built-in insert/update/delete operations.
#[async_trait]
pub trait RowAccess: Clone + Send + Sync + 'static {
    /// Insert a row under a freshly generated key.
    async fn insert_row(
        &self,
        table: &TableName,
        data: BTreeMap<String, Value>,
    ) -> StorageResult<RowKey>;

    async fn read_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>>;

    /// Merge `changes` into an existing row and return the new row.
    async fn update_row(
        &self,
        table: &TableName,
        key: &RowKey,
        changes: BTreeMap<String, Value>,
    ) -> StorageResult<Row>;

    /// Set (`Some`) or remove (`None`) individual fields of an existing row.
    async fn restore_fields(
        &self,
        table: &TableName,
        key: &RowKey,
        fields: BTreeMap<String, Option<Value>>,
    ) -> StorageResult<()>;

    /// Remove a row and return what was removed.
    async fn delete_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Row>;

    /// Put back a full row image under its original key.
    async fn restore_row(&self, table: &TableName, row: Row) -> StorageResult<()>;
}
