//! Unit-of-work coordination.
//!
//! A unit of work runs inside a storage boundary opened for it. Every
//! operation applied through its context is recorded together with an
//! inverse action. If an attempt fails or times out, the inverses run in
//! reverse order and the attempt is retried after a backoff delay.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │  (retry loop, timeout race, hooks, active registry, metrics)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │Compensatable│       │ Transaction │
//!  │   Context   │──────▶│  Operation  │       │    Hooks    │
//!  └─────────────┘ LIFO  └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txsaga::storage::{MemoryStore, TableName};
//! use txsaga::transaction::{InsertOperation, TransactionManager, TransactionOptions};
//!
//! let manager = TransactionManager::new(MemoryStore::new());
//! let orders = TableName::new("orders")?;
//!
//! let key = manager
//!     .execute_with_options(
//!         |ctx| {
//!             let orders = orders.clone();
//!             async move {
//!                 let outcome = ctx.apply(InsertOperation::from_value(orders, json!({"sku": "A1"}))?).await?;
//!                 Ok(outcome.inserted_key().cloned())
//!             }
//!         },
//!         TransactionOptions::new().max_retries(5),
//!     )
//!     .await?;
//! ```

mod context;
mod error;
mod hooks;
mod isolation;
mod manager;
mod metrics;
mod operation;
mod options;

pub use context::{CompensationFailure, CompensationReport, TransactionContext};
pub use error::{TransactionError, TransactionResult};
pub use hooks::{Hook, HookContext, HookPhase, TransactionHooks};
pub use isolation::IsolationLevel;
pub use manager::{ManagerConfig, TransactionManager, TransactionOutcome};
pub use metrics::TransactionMetrics;
pub use operation::{
    CompensatableOperation, CustomOperation, DeleteOperation, InsertOperation, OperationKind,
    OperationOutcome, UpdateOperation,
};
pub use options::TransactionOptions;
