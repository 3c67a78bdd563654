//! Transaction context: one (possibly nested) unit of work.
//!
//! A context holds the storage handle of its boundary and the ordered list
//! of operations applied so far. Completion is one-way: once a context is
//! completed, nothing can be registered on it any more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::operation::{CompensatableOperation, OperationOutcome};

type SharedOperation<H> = Arc<dyn CompensatableOperation<H>>;

/// Who is responsible for the physical boundary of a root context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundaryOwner {
    /// Opened by `execute()`, which commits or rolls it back itself.
    Execute,
    /// Opened by `begin(None)`; the caller commits or rolls back.
    Manual,
}

/// A compensation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub operation: String,
    pub error: String,
}

/// Outcome of running a context's compensations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Compensations attempted, failed ones included.
    pub attempted: usize,
    pub failures: Vec<CompensationFailure>,
}

impl CompensationReport {
    /// Every attempted compensation succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Tracks one unit of work.
pub struct TransactionContext<H> {
    id: String,
    transaction_id: String,
    handle: H,
    parent: Option<Arc<TransactionContext<H>>>,
    depth: usize,
    owner: BoundaryOwner,
    operations: Mutex<Vec<SharedOperation<H>>>,
    completed: AtomicBool,
    compensated: AtomicBool,
    started_at: DateTime<Utc>,
}

impl<H: Clone + Send + Sync + 'static> TransactionContext<H> {
    pub(crate) fn root(transaction_id: impl Into<String>, handle: H, owner: BoundaryOwner) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            transaction_id: transaction_id.into(),
            handle,
            parent: None,
            depth: 0,
            owner,
            operations: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            compensated: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// A logical child sharing the parent's handle.
    pub(crate) fn nested(parent: &Arc<Self>) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            transaction_id: parent.transaction_id.clone(),
            handle: parent.handle.clone(),
            parent: Some(Arc::clone(parent)),
            depth: parent.depth + 1,
            owner: parent.owner,
            operations: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            compensated: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the transaction this context belongs to; shared by nested
    /// contexts.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The storage handle, for operations that access the store directly.
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn parent(&self) -> Option<&Arc<TransactionContext<H>>> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_nested(&self) -> bool {
        self.depth > 0
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn owner(&self) -> BoundaryOwner {
        self.owner
    }

    /// Register an operation whose forward action has already run.
    pub fn register_operation<O>(&self, op: O) -> TransactionResult<()>
    where
        O: CompensatableOperation<H> + 'static,
    {
        self.register_shared(Arc::new(op))
    }

    fn register_shared(&self, op: SharedOperation<H>) -> TransactionResult<()> {
        let mut operations = self.operations.lock();
        if self.is_completed() {
            return Err(TransactionError::illegal_state(format!(
                "cannot register operation '{}' on completed context {}",
                op.name(),
                self.id
            )));
        }
        operations.push(op);
        Ok(())
    }

    /// Execute `op` against this context's handle and register it.
    ///
    /// A failed forward action is not registered. If the context completed
    /// while the action ran, the action is compensated right away and the
    /// call fails with `IllegalState`.
    pub async fn apply<O>(&self, mut op: O) -> TransactionResult<OperationOutcome>
    where
        O: CompensatableOperation<H> + 'static,
    {
        if self.is_completed() {
            return Err(TransactionError::illegal_state(format!(
                "cannot apply operation '{}' on completed context {}",
                op.name(),
                self.id
            )));
        }

        let outcome = op.execute(&self.handle).await?;

        let op: SharedOperation<H> = Arc::new(op);
        if let Err(e) = self.register_shared(Arc::clone(&op)) {
            if let Err(undo) = op.compensate(&self.handle).await {
                tracing::warn!(
                    context_id = %self.id,
                    operation = op.name(),
                    error = %undo,
                    "failed to undo operation applied after completion"
                );
            }
            return Err(e);
        }
        Ok(outcome)
    }

    /// Append operations handed over by a committed child.
    pub(crate) fn adopt(&self, children: Vec<SharedOperation<H>>) -> TransactionResult<()> {
        let mut operations = self.operations.lock();
        if self.is_completed() {
            return Err(TransactionError::illegal_state(format!(
                "parent context {} is already completed",
                self.id
            )));
        }
        operations.extend(children);
        Ok(())
    }

    /// Snapshot of the registered operations, in registration order.
    pub fn operations(&self) -> Vec<SharedOperation<H>> {
        self.operations.lock().clone()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.operations
            .lock()
            .iter()
            .map(|op| op.name().to_string())
            .collect()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    /// Compensate every registered operation, newest first.
    ///
    /// A failing compensation is logged and recorded in the report; the
    /// remaining ones still run. Only the first call does any work.
    pub async fn execute_compensation(&self) -> CompensationReport {
        let mut report = CompensationReport::default();
        if self.compensated.swap(true, Ordering::SeqCst) {
            return report;
        }

        let operations = self.operations();
        for op in operations.iter().rev() {
            report.attempted += 1;
            match op.compensate(&self.handle).await {
                Ok(()) => {
                    tracing::debug!(context_id = %self.id, operation = op.name(), "compensated");
                }
                Err(e) => {
                    tracing::warn!(
                        context_id = %self.id,
                        operation = op.name(),
                        error = %e,
                        "compensation failed"
                    );
                    report.failures.push(CompensationFailure {
                        operation: op.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.is_clean() {
            tracing::error!(
                transaction_id = %self.transaction_id,
                context_id = %self.id,
                failed = report.failed(),
                attempted = report.attempted,
                "context only partially compensated"
            );
        }
        report
    }

    /// Mark the context completed and take a snapshot of its operations in
    /// the same critical section, so nothing registered afterwards is lost.
    /// Returns `None` if it was already completed.
    pub(crate) fn seal(&self) -> Option<Vec<SharedOperation<H>>> {
        let operations = self.operations.lock();
        if self.completed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(operations.clone())
    }

    /// Mark the context completed. Returns `false` if it already was.
    pub fn mark_completed(&self) -> bool {
        let _operations = self.operations.lock();
        !self.completed.swap(true, Ordering::SeqCst)
    }
}

impl<H> std::fmt::Debug for TransactionContext<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("transaction_id", &self.transaction_id)
            .field("depth", &self.depth)
            .field("operations", &self.operations.lock().len())
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}
