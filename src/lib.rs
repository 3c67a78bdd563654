//! txsaga - Unit of Work coordination with compensating rollback
//!
//! This crate runs async units of work against a storage boundary, retries
//! failed attempts with backoff, races each attempt against a timeout and
//! undoes the effects of failed attempts by running recorded compensations
//! in reverse order.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use txsaga::storage::{MemoryStore, TableName};
//! use txsaga::transaction::{InsertOperation, TransactionManager, TransactionOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let orders = TableName::new("orders")?;
//! store.create_table(&orders)?;
//!
//! let manager = TransactionManager::new(store);
//! manager
//!     .execute_with_options(
//!         |ctx| {
//!             let orders = orders.clone();
//!             async move {
//!                 ctx.apply(InsertOperation::from_value(orders, json!({"sku": "A1"}))?)
//!                     .await?;
//!                 Ok(())
//!             }
//!         },
//!         TransactionOptions::new().max_retries(5),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod monitor;
pub mod storage;
pub mod transaction;
