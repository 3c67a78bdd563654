//! In-process reference store.
//!
//! Writes made through a [`MemoryHandle`] are applied to the shared tables
//! immediately; commit and rollback only close the handle. The store has no
//! native undo, so a failed unit of work is only cleaned up by the
//! compensating operations it registered.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::provider::{RowAccess, StorageProvider};
use crate::storage::row::Row;
use crate::storage::types::{RowKey, TableName};
use crate::transaction::IsolationLevel;

type Table = BTreeMap<RowKey, Row>;

/// Counters for boundaries opened against a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// handles begun but not yet committed or rolled back
    pub open: usize,
}

/// Shared in-memory tables. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    tables: RwLock<HashMap<TableName, Table>>,
    /// open handle ids and whether they are read-only
    open: RwLock<HashMap<String, bool>>,
    stats: Mutex<StoreStats>,
    begin_failures: AtomicU32,
    begin_latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table.
    pub fn create_table(&self, table: &TableName) -> StorageResult<()> {
        let mut tables = self.inner.tables.write();
        if tables.contains_key(table) {
            return Err(StorageError::TableAlreadyExists(table.clone()));
        }
        tables.insert(table.clone(), Table::new());
        Ok(())
    }

    pub fn table_exists(&self, table: &TableName) -> bool {
        self.inner.tables.read().contains_key(table)
    }

    /// Read a row outside of any boundary.
    pub fn get_row(&self, table: &TableName, key: &RowKey) -> Option<Row> {
        self.inner
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub fn row_count(&self, table: &TableName) -> usize {
        self.inner.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    /// Write a row directly, outside of any boundary.
    pub fn seed_row(&self, table: &TableName, key: RowKey, value: Value) -> StorageResult<Row> {
        let row = Row::from_value(key, value)?;
        let mut tables = self.inner.tables.write();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.clone()))?;
        rows.insert(row.key.clone(), row.clone());
        Ok(row)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = *self.inner.stats.lock();
        stats.open = self.inner.open.read().len();
        stats
    }

    /// Make the next `n` calls to `begin` fail with [`StorageError::BeginFailed`].
    pub fn fail_next_begins(&self, n: u32) {
        self.inner.begin_failures.store(n, Ordering::SeqCst);
    }

    /// Delay every `begin` by `latency`.
    pub fn set_begin_latency(&self, latency: Option<Duration>) {
        *self.inner.begin_latency.lock() = latency;
    }

    fn close(&self, handle: &MemoryHandle) -> StorageResult<()> {
        self.inner
            .open
            .write()
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| StorageError::HandleClosed(handle.id.clone()))
    }

    fn with_table<T>(
        &self,
        table: &TableName,
        f: impl FnOnce(&mut Table) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut tables = self.inner.tables.write();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.clone()))?;
        f(rows)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tables", &self.inner.tables.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    type Handle = MemoryHandle;

    async fn begin(&self, isolation: IsolationLevel, read_only: bool) -> StorageResult<MemoryHandle> {
        let latency = *self.inner.begin_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .inner
            .begin_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::BeginFailed("injected failure".to_string()));
        }

        let id = Ulid::new().to_string().to_lowercase();
        self.inner.open.write().insert(id.clone(), read_only);
        self.inner.stats.lock().begun += 1;

        Ok(MemoryHandle {
            id,
            isolation,
            read_only,
            store: self.clone(),
        })
    }

    async fn commit(&self, handle: &MemoryHandle) -> StorageResult<()> {
        self.close(handle)?;
        self.inner.stats.lock().committed += 1;
        Ok(())
    }

    async fn rollback(&self, handle: &MemoryHandle) -> StorageResult<()> {
        self.close(handle)?;
        self.inner.stats.lock().rolled_back += 1;
        Ok(())
    }
}

/// A boundary opened on a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryHandle {
    id: String,
    isolation: IsolationLevel,
    read_only: bool,
    store: MemoryStore,
}

impl MemoryHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Recorded but not enforced: every handle sees the latest writes.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_open(&self) -> bool {
        self.store.inner.open.read().contains_key(&self.id)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::HandleClosed(self.id.clone()))
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(StorageError::ReadOnly {
                handle: self.id.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[async_trait]
impl RowAccess for MemoryHandle {
    async fn insert_row(
        &self,
        table: &TableName,
        data: BTreeMap<String, Value>,
    ) -> StorageResult<RowKey> {
        self.check_writable()?;
        self.store.with_table(table, |rows| {
            let key = RowKey::generate();
            rows.insert(key.clone(), Row::new(key.clone(), data));
            Ok(key)
        })
    }

    async fn read_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>> {
        self.check_open()?;
        let tables = self.store.inner.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound(table.clone()))?;
        Ok(rows.get(key).cloned())
    }

    async fn update_row(
        &self,
        table: &TableName,
        key: &RowKey,
        changes: BTreeMap<String, Value>,
    ) -> StorageResult<Row> {
        self.check_writable()?;
        self.store.with_table(table, |rows| {
            let row = rows.get_mut(key).ok_or_else(|| StorageError::RowNotFound {
                table: table.clone(),
                key: key.clone(),
            })?;
            row.merge_data(changes);
            Ok(row.clone())
        })
    }

    async fn restore_fields(
        &self,
        table: &TableName,
        key: &RowKey,
        fields: BTreeMap<String, Option<Value>>,
    ) -> StorageResult<()> {
        self.check_writable()?;
        self.store.with_table(table, |rows| {
            let row = rows.get_mut(key).ok_or_else(|| StorageError::RowNotFound {
                table: table.clone(),
                key: key.clone(),
            })?;
            row.restore_fields(fields);
            Ok(())
        })
    }

    async fn delete_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Row> {
        self.check_writable()?;
        self.store.with_table(table, |rows| {
            rows.remove(key).ok_or_else(|| StorageError::RowNotFound {
                table: table.clone(),
                key: key.clone(),
            })
        })
    }

    async fn restore_row(&self, table: &TableName, row: Row) -> StorageResult<()> {
        self.check_writable()?;
        self.store.with_table(table, |rows| {
            if rows.contains_key(&row.key) {
                return Err(StorageError::RowAlreadyExists {
                    table: table.clone(),
                    key: row.key.clone(),
                });
            }
            rows.insert(row.key.clone(), row);
            Ok(())
        })
    }
}
