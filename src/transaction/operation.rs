//! Compensatable operations: forward actions paired with their inverse.
//!
//! Undo state lives on the operation, captured when the forward action
//! runs. Compensation therefore works on stores without savepoints, and
//! still works after the affected row has changed or disappeared.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::storage::{object_fields, Row, RowAccess, RowKey, StorageError, TableName};
use crate::transaction::error::TransactionResult;

/// Which built-in variant an operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Custom,
}

/// What the forward action produced.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Key generated for the inserted row.
    Inserted(RowKey),
    /// The row after the update.
    Updated(Row),
    /// The removed row.
    Deleted(Row),
    Custom(Value),
}

impl OperationOutcome {
    pub fn inserted_key(&self) -> Option<&RowKey> {
        match self {
            OperationOutcome::Inserted(key) => Some(key),
            _ => None,
        }
    }
}

/// A forward action and its inverse, run against a storage handle `H`.
#[async_trait]
pub trait CompensatableOperation<H>: Send + Sync {
    /// Diagnostic label.
    fn name(&self) -> &str;

    fn kind(&self) -> OperationKind {
        OperationKind::Custom
    }

    /// Apply the forward action, capturing whatever `compensate` needs.
    async fn execute(&mut self, handle: &H) -> TransactionResult<OperationOutcome>;

    /// Undo the forward action.
    async fn compensate(&self, handle: &H) -> TransactionResult<()>;
}

/// Insert a row; compensation deletes it by its generated key.
#[derive(Debug, Clone)]
pub struct InsertOperation {
    name: String,
    table: TableName,
    data: BTreeMap<String, Value>,
    key: Option<RowKey>,
}

impl InsertOperation {
    pub fn new(table: TableName, data: BTreeMap<String, Value>) -> Self {
        Self {
            name: format!("insert:{}", table),
            table,
            data,
            key: None,
        }
    }

    /// Build from a JSON object.
    pub fn from_value(table: TableName, value: Value) -> TransactionResult<Self> {
        Ok(Self::new(table, object_fields(value)?))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Key generated by `execute`, if it ran.
    pub fn key(&self) -> Option<&RowKey> {
        self.key.as_ref()
    }
}

#[async_trait]
impl<H: RowAccess> CompensatableOperation<H> for InsertOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Insert
    }

    async fn execute(&mut self, handle: &H) -> TransactionResult<OperationOutcome> {
        let key = handle.insert_row(&self.table, self.data.clone()).await?;
        self.key = Some(key.clone());
        Ok(OperationOutcome::Inserted(key))
    }

    async fn compensate(&self, handle: &H) -> TransactionResult<()> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        match handle.delete_row(&self.table, key).await {
            Ok(_) => Ok(()),
            // already gone, which is the state compensation wants
            Err(StorageError::RowNotFound { .. }) => {
                tracing::debug!(table = %self.table, key = %key, "inserted row already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Update fields of a row; compensation restores the captured "before"
/// values and removes fields the row did not have.
#[derive(Debug, Clone)]
pub struct UpdateOperation {
    name: String,
    table: TableName,
    key: RowKey,
    changes: BTreeMap<String, Value>,
    before: Option<BTreeMap<String, Option<Value>>>,
}

impl UpdateOperation {
    pub fn new(table: TableName, key: RowKey, changes: BTreeMap<String, Value>) -> Self {
        Self {
            name: format!("update:{}/{}", table, key),
            table,
            key,
            changes,
            before: None,
        }
    }

    pub fn from_value(table: TableName, key: RowKey, changes: Value) -> TransactionResult<Self> {
        Ok(Self::new(table, key, object_fields(changes)?))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Field values captured before the update ran.
    pub fn before(&self) -> Option<&BTreeMap<String, Option<Value>>> {
        self.before.as_ref()
    }
}

#[async_trait]
impl<H: RowAccess> CompensatableOperation<H> for UpdateOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Update
    }

    async fn execute(&mut self, handle: &H) -> TransactionResult<OperationOutcome> {
        let current = handle
            .read_row(&self.table, &self.key)
            .await?
            .ok_or_else(|| StorageError::RowNotFound {
                table: self.table.clone(),
                key: self.key.clone(),
            })?;

        let before = self
            .changes
            .keys()
            .map(|field| (field.clone(), current.get(field).cloned()))
            .collect();
        self.before = Some(before);

        let updated = handle
            .update_row(&self.table, &self.key, self.changes.clone())
            .await?;
        Ok(OperationOutcome::Updated(updated))
    }

    async fn compensate(&self, handle: &H) -> TransactionResult<()> {
        let Some(before) = &self.before else {
            return Ok(());
        };
        handle
            .restore_fields(&self.table, &self.key, before.clone())
            .await?;
        Ok(())
    }
}

/// Delete a row; compensation reinserts the pre-image removed at execute
/// time.
#[derive(Debug, Clone)]
pub struct DeleteOperation {
    name: String,
    table: TableName,
    key: RowKey,
    pre_image: Option<Row>,
}

impl DeleteOperation {
    pub fn new(table: TableName, key: RowKey) -> Self {
        Self {
            name: format!("delete:{}/{}", table, key),
            table,
            key,
            pre_image: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pre_image(&self) -> Option<&Row> {
        self.pre_image.as_ref()
    }
}

#[async_trait]
impl<H: RowAccess> CompensatableOperation<H> for DeleteOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Delete
    }

    async fn execute(&mut self, handle: &H) -> TransactionResult<OperationOutcome> {
        let removed = handle.delete_row(&self.table, &self.key).await?;
        self.pre_image = Some(removed.clone());
        Ok(OperationOutcome::Deleted(removed))
    }

    async fn compensate(&self, handle: &H) -> TransactionResult<()> {
        let Some(row) = &self.pre_image else {
            return Ok(());
        };
        handle.restore_row(&self.table, row.clone()).await?;
        Ok(())
    }
}

type ExecuteFn<H> = Arc<dyn Fn(H) -> BoxFuture<'static, TransactionResult<Value>> + Send + Sync>;
type CompensateFn<H> = Arc<dyn Fn(H) -> BoxFuture<'static, TransactionResult<()>> + Send + Sync>;

/// An operation built from caller-supplied closures.
pub struct CustomOperation<H> {
    name: String,
    execute: Option<ExecuteFn<H>>,
    compensate: CompensateFn<H>,
}

impl<H> CustomOperation<H> {
    pub fn new<E, EFut, C, CFut>(name: impl Into<String>, execute: E, compensate: C) -> Self
    where
        E: Fn(H) -> EFut + Send + Sync + 'static,
        EFut: Future<Output = TransactionResult<Value>> + Send + 'static,
        C: Fn(H) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = TransactionResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Some(Arc::new(move |handle| execute(handle).boxed())),
            compensate: Arc::new(move |handle| compensate(handle).boxed()),
        }
    }

    /// An operation whose forward effect the caller already applied;
    /// executing it yields `Value::Null`.
    pub fn compensation_only<C, CFut>(name: impl Into<String>, compensate: C) -> Self
    where
        C: Fn(H) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = TransactionResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: None,
            compensate: Arc::new(move |handle| compensate(handle).boxed()),
        }
    }
}

impl<H> std::fmt::Debug for CustomOperation<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomOperation")
            .field("name", &self.name)
            .field("has_execute", &self.execute.is_some())
            .finish()
    }
}

#[async_trait]
impl<H: Clone + Send + Sync + 'static> CompensatableOperation<H> for CustomOperation<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self, handle: &H) -> TransactionResult<OperationOutcome> {
        match &self.execute {
            Some(execute) => execute(handle.clone()).await.map(OperationOutcome::Custom),
            None => Ok(OperationOutcome::Custom(Value::Null)),
        }
    }

    async fn compensate(&self, handle: &H) -> TransactionResult<()> {
        (self.compensate)(handle.clone()).await
    }
}
