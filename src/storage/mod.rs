//! storage collaborator for the coordinator
//!
//! The coordinator never touches a concrete store. It talks to a
//! [`StorageProvider`] to open, commit and roll back boundaries, and the
//! built-in compensatable operations talk to the provider's handle through
//! [`RowAccess`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TransactionManager                       │
//! └─────────────────────────────────────────────────────────────┘
//!                │ begin / commit / rollback
//!                ▼
//!  ┌──────────────────────────┐        ┌──────────────────────────┐
//!  │     StorageProvider      │───────▶│   Handle (RowAccess)     │
//!  │  (MemoryStore, or yours) │ begin  │  insert/update/delete    │
//!  └──────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txsaga::storage::{MemoryStore, RowKey, TableName};
//!
//! let store = MemoryStore::new();
//! let accounts = TableName::new("accounts")?;
//! store.create_table(&accounts)?;
//! store.seed_row(&accounts, RowKey::new("acc-1")?, json!({"balance": 100}))?;
//! ```

mod error;
mod memory;
mod provider;
mod row;
mod types;

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryHandle, MemoryStore, StoreStats};
pub use provider::{RowAccess, StorageProvider};
pub use row::{object_fields, Row};
pub use types::{InvalidNameError, RowKey, TableName};
