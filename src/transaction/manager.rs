//! Transaction manager - coordinates units of work.
//!
//! The TransactionManager is the main entry point. It handles:
//! - Opening a storage boundary per attempt, raced against a timeout
//! - Retrying failed attempts with fixed or exponential backoff
//! - Compensating the operations of every failed attempt
//! - Dispatching lifecycle hooks
//! - Tracking active contexts and per-transaction metrics

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::storage::StorageProvider;
use crate::transaction::context::{BoundaryOwner, CompensationReport, TransactionContext};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::{run_chain, HookContext, HookPhase, HookRegistry, TransactionHooks};
use crate::transaction::metrics::TransactionMetrics;
use crate::transaction::options::TransactionOptions;

type SharedContext<S> = Arc<TransactionContext<<S as StorageProvider>::Handle>>;

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Options used by `execute()` and by manually begun root contexts.
    pub default_options: TransactionOptions,
    /// How many transactions' metrics the manager keeps; the oldest
    /// finished ones are dropped first.
    pub metrics_retention: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_options: TransactionOptions::default(),
            metrics_retention: 1000,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> TransactionResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TransactionError::Validation(e.to_string()))?;
        config.default_options.validate()?;
        Ok(config)
    }

    pub fn default_options(mut self, options: TransactionOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn metrics_retention(mut self, value: usize) -> Self {
        self.metrics_retention = value;
        self
    }
}

/// Result of a successful `execute_with_outcome()`.
#[derive(Debug, Clone)]
pub struct TransactionOutcome<T> {
    pub value: T,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    pub transaction_id: String,
    pub metrics: TransactionMetrics,
}

/// Transaction manager - coordinates all units of work on one store.
///
/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
pub struct TransactionManager<S: StorageProvider> {
    inner: Arc<TransactionManagerInner<S>>,
}

struct TransactionManagerInner<S: StorageProvider> {
    /// The underlying store.
    storage: S,
    config: ManagerConfig,
    /// Contexts that have not reached commit or rollback yet, by context id.
    active: RwLock<HashMap<String, SharedContext<S>>>,
    metrics: RwLock<MetricsLedger>,
    hooks: RwLock<HookRegistry>,
}

/// Metrics by transaction id, remembering insertion order for eviction.
#[derive(Default)]
struct MetricsLedger {
    entries: HashMap<String, TransactionMetrics>,
    order: VecDeque<String>,
}

impl MetricsLedger {
    fn upsert(&mut self, metrics: TransactionMetrics, retention: usize) {
        let id = metrics.transaction_id.clone();
        if self.entries.insert(id.clone(), metrics).is_none() {
            self.order.push_back(id);
        }

        while self.entries.len() > retention {
            let oldest_finished = self
                .order
                .iter()
                .position(|id| self.entries.get(id).map_or(true, |m| m.is_finished()));
            let Some(position) = oldest_finished else {
                break;
            };
            if let Some(id) = self.order.remove(position) {
                self.entries.remove(&id);
            }
        }
    }
}

/// State of one attempt inside `execute()`.
struct Attempt<'a, H> {
    tx_id: &'a str,
    /// 1-based
    number: u32,
    options: &'a TransactionOptions,
    metrics: &'a Mutex<TransactionMetrics>,
    /// Set once the boundary is open; read again after a timeout.
    context: Mutex<Option<Arc<TransactionContext<H>>>>,
}

impl<'a, H: Clone + Send + Sync + 'static> Attempt<'a, H> {
    fn new(
        tx_id: &'a str,
        number: u32,
        options: &'a TransactionOptions,
        metrics: &'a Mutex<TransactionMetrics>,
    ) -> Self {
        Self {
            tx_id,
            number,
            options,
            metrics,
            context: Mutex::new(None),
        }
    }

    fn bind(&self, context: Arc<TransactionContext<H>>) {
        *self.context.lock() = Some(context);
    }

    fn context(&self) -> Option<Arc<TransactionContext<H>>> {
        self.context.lock().clone()
    }

    fn hook_context(&self, phase: HookPhase, context: Option<&TransactionContext<H>>) -> HookContext {
        HookContext {
            phase,
            transaction_id: self.tx_id.to_string(),
            context_id: context.map(|c| c.id().to_string()),
            depth: context.map_or(0, |c| c.depth()),
            attempt: self.number,
            operations: context.map_or(0, |c| c.operation_count()),
            isolation_level: self.options.isolation_level,
            read_only: self.options.read_only,
            metrics: self.metrics.lock().clone(),
            error: None,
            delay_ms: None,
            compensation: None,
            timestamp: Utc::now(),
        }
    }
}

impl<S: StorageProvider> Clone for TransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StorageProvider> TransactionManager<S> {
    /// Create a new transaction manager for the given store.
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, ManagerConfig::default())
    }

    pub fn with_config(storage: S, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                storage,
                config,
                active: RwLock::new(HashMap::new()),
                metrics: RwLock::new(MetricsLedger::default()),
                hooks: RwLock::new(HookRegistry::default()),
            }),
        }
    }

    /// Get a reference to the underlying store.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    // ==================== Hooks ====================

    /// Merge `hooks` into the existing chains; nothing is replaced.
    pub fn register_hooks(&self, hooks: TransactionHooks) {
        self.inner.hooks.write().merge(hooks);
    }

    /// Number of callbacks chained on `phase`.
    pub fn hook_count(&self, phase: HookPhase) -> usize {
        self.inner.hooks.read().count(phase)
    }

    fn fire(&self, context: &HookContext) -> TransactionResult<()> {
        let chain = self.inner.hooks.read().chain(context.phase);
        run_chain(&chain, context)
    }

    /// Fire hooks whose failure must not change the outcome.
    fn fire_logged(&self, context: &HookContext) {
        if let Err(e) = self.fire(context) {
            tracing::warn!(
                transaction_id = %context.transaction_id,
                phase = %context.phase,
                error = %e,
                "hook failed"
            );
        }
    }

    // ==================== Registry ====================

    /// Get the number of active contexts.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// List all active context IDs.
    pub fn active_contexts(&self) -> Vec<String> {
        self.inner.active.read().keys().cloned().collect()
    }

    /// Check if a context is active.
    pub fn is_active(&self, context_id: &str) -> bool {
        self.inner.active.read().contains_key(context_id)
    }

    pub fn get_context(&self, context_id: &str) -> Option<SharedContext<S>> {
        self.inner.active.read().get(context_id).cloned()
    }

    fn track(&self, context: &SharedContext<S>) {
        self.inner
            .active
            .write()
            .insert(context.id().to_string(), Arc::clone(context));
    }

    fn untrack(&self, context_id: &str) {
        self.inner.active.write().remove(context_id);
    }

    /// Metrics of a transaction run through `execute()`.
    pub fn metrics(&self, transaction_id: &str) -> Option<TransactionMetrics> {
        self.inner.metrics.read().entries.get(transaction_id).cloned()
    }

    /// Retained metrics, oldest first.
    pub fn recent_metrics(&self) -> Vec<TransactionMetrics> {
        let ledger = self.inner.metrics.read();
        ledger
            .order
            .iter()
            .filter_map(|id| ledger.entries.get(id).cloned())
            .collect()
    }

    fn record_metrics(&self, metrics: &TransactionMetrics) {
        self.inner
            .metrics
            .write()
            .upsert(metrics.clone(), self.inner.config.metrics_retention);
    }

    // ==================== Manual API ====================

    /// Begin a context.
    ///
    /// With a parent, the new context is a logical child sharing the
    /// parent's handle; no savepoint is created. Without one, a boundary is
    /// opened on the store with the configured default options and the
    /// caller owns it.
    pub async fn begin(&self, parent: Option<&SharedContext<S>>) -> TransactionResult<SharedContext<S>> {
        let context = match parent {
            Some(parent) => {
                if parent.is_completed() {
                    return Err(TransactionError::illegal_state(format!(
                        "cannot begin a nested context inside completed context {}",
                        parent.id()
                    )));
                }
                Arc::new(TransactionContext::nested(parent))
            }
            None => {
                let options = &self.inner.config.default_options;
                let handle = self
                    .inner
                    .storage
                    .begin(options.isolation_level, options.read_only)
                    .await?;
                let tx_id = Ulid::new().to_string().to_lowercase();
                Arc::new(TransactionContext::root(tx_id, handle, BoundaryOwner::Manual))
            }
        };

        self.track(&context);
        tracing::debug!(
            transaction_id = %context.transaction_id(),
            context_id = %context.id(),
            depth = context.depth(),
            "context begun"
        );
        Ok(context)
    }

    /// Commit a context.
    ///
    /// A nested context hands its operations to its parent, which must still
    /// be active, so a later failure of the parent undoes them too. A root
    /// begun with `begin(None)` is committed on the store. Roots opened by
    /// `execute()` are committed by `execute()` and are rejected here.
    pub async fn commit(&self, context: &SharedContext<S>) -> TransactionResult<()> {
        if context.is_completed() {
            return Err(TransactionError::illegal_state(format!(
                "context {} is already completed",
                context.id()
            )));
        }
        if !self.is_active(context.id()) {
            return Err(TransactionError::illegal_state(format!(
                "unknown context {}",
                context.id()
            )));
        }

        match context.parent() {
            Some(parent) => {
                if parent.is_completed() {
                    return Err(TransactionError::illegal_state(format!(
                        "parent context {} is already completed",
                        parent.id()
                    )));
                }
                let Some(operations) = context.seal() else {
                    return Err(TransactionError::illegal_state(format!(
                        "context {} is already completed",
                        context.id()
                    )));
                };
                self.untrack(context.id());
                if let Err(e) = parent.adopt(operations) {
                    // parent finished in between; nobody else will undo the child's work
                    context.execute_compensation().await;
                    return Err(e);
                }
            }
            None if context.owner() == BoundaryOwner::Execute => {
                return Err(TransactionError::illegal_state(format!(
                    "root context {} is committed by its execute() boundary",
                    context.id()
                )));
            }
            None => {
                context.mark_completed();
                let committed = self.inner.storage.commit(context.handle()).await;
                self.untrack(context.id());
                committed?;
            }
        }

        tracing::debug!(context_id = %context.id(), depth = context.depth(), "context committed");
        Ok(())
    }

    /// Roll a context back by compensating its operations.
    ///
    /// Rolling back a completed context does nothing.
    pub async fn rollback(&self, context: &SharedContext<S>) -> TransactionResult<CompensationReport> {
        if context.is_completed() {
            return Ok(CompensationReport::default());
        }
        if !self.is_active(context.id()) {
            return Err(TransactionError::illegal_state(format!(
                "unknown context {}",
                context.id()
            )));
        }

        let report = context.execute_compensation().await;
        context.mark_completed();

        if context.parent().is_none() && context.owner() == BoundaryOwner::Manual {
            if let Err(e) = self.inner.storage.rollback(context.handle()).await {
                tracing::warn!(context_id = %context.id(), error = %e, "storage rollback failed");
            }
        }
        self.untrack(context.id());

        tracing::debug!(
            context_id = %context.id(),
            compensated = report.attempted,
            "context rolled back"
        );
        Ok(report)
    }

    // ==================== Unit of work ====================

    /// Execute `work` as a unit of work with the default options.
    pub async fn execute<T, F, Fut>(&self, work: F) -> TransactionResult<T>
    where
        F: Fn(SharedContext<S>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        let options = self.inner.config.default_options.clone();
        self.execute_with_options(work, options).await
    }

    /// Execute `work` as a unit of work.
    pub async fn execute_with_options<T, F, Fut>(
        &self,
        work: F,
        options: TransactionOptions,
    ) -> TransactionResult<T>
    where
        F: Fn(SharedContext<S>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        self.execute_with_outcome(work, options)
            .await
            .map(|outcome| outcome.value)
    }

    /// Execute `work` as a unit of work and report how it went.
    ///
    /// Every attempt opens a fresh boundary and context. A failed attempt
    /// has its operations compensated, newest first, before the next one
    /// starts. Validation and illegal-state errors end the call at once;
    /// anything else is retried until `max_retries` is used up, after which
    /// the last attempt's error is returned inside `RetryExhausted`.
    pub async fn execute_with_outcome<T, F, Fut>(
        &self,
        work: F,
        options: TransactionOptions,
    ) -> TransactionResult<TransactionOutcome<T>>
    where
        F: Fn(SharedContext<S>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        options.validate()?;

        let tx_id = Ulid::new().to_string().to_lowercase();
        let metrics = Mutex::new(TransactionMetrics::start(&tx_id));
        let initial = metrics.lock().clone();
        self.record_metrics(&initial);

        tracing::debug!(
            transaction_id = %tx_id,
            isolation = %options.isolation_level,
            read_only = options.read_only,
            max_retries = options.max_retries,
            "transaction started"
        );

        let mut attempt_index: u32 = 0;
        loop {
            metrics.lock().retry_count = attempt_index;
            let attempt = Attempt::new(&tx_id, attempt_index + 1, &options, &metrics);

            let raced = tokio::time::timeout(options.timeout(), self.run_attempt(&work, &attempt)).await;
            let err = match raced {
                Ok(Ok(value)) => {
                    let attempts = attempt.number;
                    let final_metrics = metrics.lock().clone();
                    self.record_metrics(&final_metrics);
                    tracing::debug!(
                        transaction_id = %tx_id,
                        attempts,
                        duration_ms = final_metrics.duration_ms,
                        "transaction committed"
                    );
                    return Ok(TransactionOutcome {
                        value,
                        attempts,
                        transaction_id: tx_id,
                        metrics: final_metrics,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    let err = TransactionError::Timeout {
                        tx_id: tx_id.clone(),
                        timeout_ms: options.timeout_ms,
                    };
                    let mut timeout = attempt.hook_context(HookPhase::OnTimeout, attempt.context().as_deref());
                    timeout.error = Some(err.to_string());
                    tracing::warn!(
                        transaction_id = %tx_id,
                        attempt = attempt.number,
                        timeout_ms = options.timeout_ms,
                        "attempt timed out"
                    );
                    self.fire_logged(&timeout);
                    err
                }
            };

            self.fail_attempt(&attempt, &err).await;

            let retryable = err.is_retryable() && attempt_index < options.max_retries;
            if retryable {
                metrics.lock().reopen();
            }
            let snapshot = metrics.lock().clone();
            self.record_metrics(&snapshot);

            if !err.is_retryable() {
                tracing::warn!(transaction_id = %tx_id, error = %err, "transaction failed");
                return Err(err);
            }
            if !retryable {
                let attempts = attempt.number;
                tracing::warn!(
                    transaction_id = %tx_id,
                    attempts,
                    error = %err,
                    "transaction failed, retries exhausted"
                );
                return Err(TransactionError::RetryExhausted {
                    tx_id,
                    attempts,
                    source: Box::new(err),
                });
            }

            let retry = attempt_index + 1;
            let delay = options.backoff_delay(retry);
            let mut on_retry = attempt.hook_context(HookPhase::OnRetry, attempt.context().as_deref());
            on_retry.attempt = retry;
            on_retry.error = Some(err.to_string());
            on_retry.delay_ms = Some(delay.as_millis() as u64);
            tracing::info!(
                transaction_id = %tx_id,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying transaction"
            );
            if let Err(hook_err) = self.fire(&on_retry) {
                let failed = {
                    let mut metrics = metrics.lock();
                    metrics.record_failure(hook_err.to_string());
                    metrics.clone()
                };
                self.record_metrics(&failed);
                return Err(hook_err);
            }

            tokio::time::sleep(delay).await;
            attempt_index += 1;
        }
    }

    /// Begin, work and commit; the part of an attempt raced against the
    /// timeout. Failures are cleaned up by `fail_attempt`.
    async fn run_attempt<T, F, Fut>(
        &self,
        work: &F,
        attempt: &Attempt<'_, S::Handle>,
    ) -> TransactionResult<T>
    where
        F: Fn(SharedContext<S>) -> Fut + Send + Sync,
        Fut: Future<Output = TransactionResult<T>> + Send,
        T: Send,
    {
        let handle = self
            .inner
            .storage
            .begin(attempt.options.isolation_level, attempt.options.read_only)
            .await?;
        let context = Arc::new(TransactionContext::root(
            attempt.tx_id,
            handle,
            BoundaryOwner::Execute,
        ));
        attempt.bind(Arc::clone(&context));
        self.track(&context);

        tracing::debug!(
            transaction_id = %attempt.tx_id,
            context_id = %context.id(),
            attempt = attempt.number,
            "attempt started"
        );

        self.fire(&attempt.hook_context(HookPhase::BeforeBegin, Some(&context)))?;
        self.fire(&attempt.hook_context(HookPhase::AfterBegin, Some(&context)))?;

        let value = work(Arc::clone(&context)).await?;

        if context.is_completed() {
            return Err(TransactionError::illegal_state(format!(
                "context {} was completed before its work returned",
                context.id()
            )));
        }
        attempt.metrics.lock().operations_count = context.operation_count();
        self.fire(&attempt.hook_context(HookPhase::BeforeCommit, Some(&context)))?;

        context.mark_completed();
        attempt.metrics.lock().record_success();
        // the boundary is not committed yet, so an after_commit error still fails the attempt
        self.fire(&attempt.hook_context(HookPhase::AfterCommit, Some(&context)))?;

        self.inner.storage.commit(context.handle()).await?;
        self.untrack(context.id());
        Ok(value)
    }

    /// Roll back a failed or timed-out attempt: rollback hooks, LIFO
    /// compensation and the physical rollback, outside the timeout.
    async fn fail_attempt(&self, attempt: &Attempt<'_, S::Handle>, err: &TransactionError) {
        let message = err.to_string();
        let context = attempt.context();

        {
            let mut metrics = attempt.metrics.lock();
            if let Some(context) = &context {
                metrics.operations_count = context.operation_count();
            }
            metrics.record_failure(message.clone());
        }

        let Some(context) = context else {
            tracing::debug!(
                transaction_id = %attempt.tx_id,
                attempt = attempt.number,
                error = %err,
                "attempt failed before a context was opened"
            );
            return;
        };

        let mut before = attempt.hook_context(HookPhase::BeforeRollback, Some(&context));
        before.error = Some(message.clone());
        self.fire_logged(&before);

        let report = context.execute_compensation().await;
        context.mark_completed();
        if let Err(e) = self.inner.storage.rollback(context.handle()).await {
            tracing::debug!(context_id = %context.id(), error = %e, "storage rollback failed");
        }
        self.untrack(context.id());

        tracing::debug!(
            transaction_id = %attempt.tx_id,
            context_id = %context.id(),
            attempt = attempt.number,
            compensated = report.attempted,
            compensation_failures = report.failed(),
            error = %err,
            "attempt rolled back"
        );

        let mut after = attempt.hook_context(HookPhase::AfterRollback, Some(&context));
        after.error = Some(message);
        after.compensation = Some(report);
        self.fire_logged(&after);
    }
}

impl<S: StorageProvider> std::fmt::Debug for TransactionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::storage::{MemoryHandle, MemoryStore, RowKey, TableName};
    use crate::transaction::operation::{CustomOperation, InsertOperation, UpdateOperation};

    type Context = Arc<TransactionContext<MemoryHandle>>;

    fn setup() -> (MemoryStore, TransactionManager<MemoryStore>, TableName) {
        let store = MemoryStore::new();
        let table = TableName::new("orders").unwrap();
        store.create_table(&table).unwrap();
        let manager = TransactionManager::new(store.clone());
        (store, manager, table)
    }

    fn fast_retries(max_retries: u32) -> TransactionOptions {
        TransactionOptions::new()
            .max_retries(max_retries)
            .retry_delay_ms(1)
            .exponential_backoff(false)
    }

    fn phase_log(manager: &TransactionManager<MemoryStore>) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = TransactionHooks::new();
        for phase in [
            HookPhase::BeforeBegin,
            HookPhase::AfterBegin,
            HookPhase::BeforeCommit,
            HookPhase::AfterCommit,
            HookPhase::BeforeRollback,
            HookPhase::AfterRollback,
        ] {
            let log = log.clone();
            hooks = hooks.on(phase, move |ctx| {
                log.lock().push(ctx.phase.to_string());
                Ok(())
            });
        }
        manager.register_hooks(hooks);
        log
    }

    #[tokio::test]
    async fn test_execute_returns_value_and_commits() {
        let (store, manager, table) = setup();

        let outcome = manager
            .execute_with_outcome(
                |ctx: Context| {
                    let table = table.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(table, json!({"sku": "A1"}))?)
                            .await?;
                        Ok(42)
                    }
                },
                TransactionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.metrics.success);
        assert_eq!(outcome.metrics.operations_count, 1);
        assert_eq!(manager.metrics(&outcome.transaction_id), Some(outcome.metrics));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(store.row_count(&table), 1);
        assert_eq!(store.stats().committed, 1);
        assert_eq!(store.stats().open, 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (_store, manager, _table) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = manager
            .execute_with_outcome(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if call < 3 {
                            Err(TransactionError::work(format!("attempt {} failed", call)))
                        } else {
                            Ok("success")
                        }
                    }
                },
                TransactionOptions::new()
                    .max_retries(3)
                    .retry_delay_ms(10)
                    .exponential_backoff(false),
            )
            .await
            .unwrap();

        assert_eq!(outcome.value, "success");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.metrics.retry_count, 2);
        assert!(outcome.metrics.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_work_runs_max_retries_plus_one_times() {
        let (store, manager, _table) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = manager
            .execute_with_options(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Err::<(), _>(TransactionError::work(format!("failure {}", call)))
                    }
                },
                fast_retries(2),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.last_attempt_error().to_string(), "failure 3");
        assert_eq!(store.stats().rolled_back, 3);
        assert_eq!(manager.active_count(), 0);

        let metrics = manager.recent_metrics();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert_eq!(metrics[0].retry_count, 2);
        assert_eq!(metrics[0].error.as_deref(), Some("failure 3"));
    }

    #[tokio::test]
    async fn test_insert_is_compensated_on_failure() {
        let (store, manager, table) = setup();
        let inserted = Arc::new(Mutex::new(None));

        let slot = inserted.clone();
        let result = manager
            .execute_with_options(
                move |ctx: Context| {
                    let table = table.clone();
                    let slot = slot.clone();
                    async move {
                        let outcome = ctx
                            .apply(InsertOperation::from_value(table, json!({"sku": "B2"}))?)
                            .await?;
                        *slot.lock() = outcome.inserted_key().cloned();
                        Err::<(), _>(TransactionError::work("payment declined"))
                    }
                },
                fast_retries(0),
            )
            .await;

        assert!(result.is_err());
        let key: RowKey = inserted.lock().clone().unwrap();
        let table = TableName::new("orders").unwrap();
        assert!(store.get_row(&table, &key).is_none());
        assert_eq!(store.row_count(&table), 0);
    }

    #[tokio::test]
    async fn test_update_is_restored_on_failure() {
        let (store, manager, table) = setup();
        let key = RowKey::new("order-1").unwrap();
        store.seed_row(&table, key.clone(), json!({"value": 100})).unwrap();

        let result = manager
            .execute_with_options(
                |ctx: Context| {
                    let table = table.clone();
                    let key = key.clone();
                    async move {
                        ctx.apply(UpdateOperation::from_value(table, key, json!({"value": 200}))?)
                            .await?;
                        Err::<(), _>(TransactionError::work("downstream failure"))
                    }
                },
                fast_retries(0),
            )
            .await;

        assert!(result.is_err());
        let row = store.get_row(&table, &key).unwrap();
        assert_eq!(row.get("value"), Some(&json!(100)));
    }

    #[tokio::test]
    async fn test_timeout_gives_up_and_compensates() {
        let (store, manager, table) = setup();
        let timeouts = Arc::new(AtomicU32::new(0));
        let seen = timeouts.clone();
        manager.register_hooks(TransactionHooks::new().on_timeout(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let started = Instant::now();
        let err = manager
            .execute_with_options(
                |ctx: Context| {
                    let table = table.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(table, json!({"sku": "slow"}))?)
                            .await?;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    }
                },
                TransactionOptions::new().timeout_ms(50).max_retries(0),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        // the abandoned attempt's insert was undone
        assert_eq!(store.row_count(&table), 0);
        assert_eq!(store.stats().open, 0);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_while_opening_boundary() {
        let (store, manager, _table) = setup();
        store.set_begin_latency(Some(Duration::from_millis(100)));
        let log = phase_log(&manager);

        let err = manager
            .execute_with_options(
                |_ctx| async { Ok(()) },
                TransactionOptions::new().timeout_ms(20).max_retries(0),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        // no context was opened, so there is nothing to roll back
        assert!(log.lock().is_empty());
        assert_eq!(store.stats().begun, 0);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_hook_order_on_success() {
        let (_store, manager, _table) = setup();
        let log = phase_log(&manager);

        let work_log = log.clone();
        manager
            .execute(move |_ctx| {
                let log = work_log.clone();
                async move {
                    log.lock().push("work".to_string());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["before_begin", "after_begin", "work", "before_commit", "after_commit"]
        );
    }

    #[tokio::test]
    async fn test_hook_order_on_failure() {
        let (_store, manager, _table) = setup();
        let log = phase_log(&manager);

        let work_log = log.clone();
        let result = manager
            .execute_with_options(
                move |_ctx| {
                    let log = work_log.clone();
                    async move {
                        log.lock().push("work".to_string());
                        Err::<(), _>(TransactionError::work("nope"))
                    }
                },
                fast_retries(0),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(
            *log.lock(),
            vec!["before_begin", "after_begin", "work", "before_rollback", "after_rollback"]
        );
    }

    #[tokio::test]
    async fn test_every_failed_attempt_is_compensated() {
        let (_store, manager, _table) = setup();
        let compensations = Arc::new(AtomicU32::new(0));

        let counter = compensations.clone();
        let result = manager
            .execute_with_options(
                move |ctx: Context| {
                    let counter = counter.clone();
                    async move {
                        ctx.register_operation(CustomOperation::compensation_only(
                            "release hold",
                            move |_| {
                                let counter = counter.clone();
                                async move {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                }
                            },
                        ))?;
                        Err::<(), _>(TransactionError::work("flaky"))
                    }
                },
                fast_retries(2),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(compensations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_any_attempt() {
        let (store, manager, _table) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = manager
            .execute_with_options(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                TransactionOptions::new().timeout_ms(0),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.stats().begun, 0);
    }

    #[tokio::test]
    async fn test_illegal_state_is_not_retried() {
        let (_store, manager, _table) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = manager
            .execute_with_options(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TransactionError::illegal_state("bad state"))
                    }
                },
                fast_retries(3),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::IllegalState(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_storage_begin_failures_are_retried() {
        let (store, manager, _table) = setup();
        store.fail_next_begins(2);
        let retries = Arc::new(Mutex::new(Vec::new()));

        let seen = retries.clone();
        manager.register_hooks(TransactionHooks::new().on_retry(move |ctx| {
            assert!(ctx.context_id.is_none());
            seen.lock().push((ctx.attempt, ctx.error.clone().unwrap_or_default()));
            Ok(())
        }));

        let outcome = manager
            .execute_with_outcome(|_ctx| async { Ok(()) }, fast_retries(3))
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        let retries = retries.lock();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 1);
        assert_eq!(retries[1].0, 2);
        assert!(retries[0].1.contains("injected failure"));
    }

    #[tokio::test]
    async fn test_on_retry_reports_backoff_delays() {
        let (_store, manager, _table) = setup();
        let delays = Arc::new(Mutex::new(Vec::new()));

        let seen = delays.clone();
        manager.register_hooks(TransactionHooks::new().on_retry(move |ctx| {
            seen.lock().push(ctx.delay_ms.unwrap_or_default());
            Ok(())
        }));

        let _ = manager
            .execute_with_options(
                |_ctx| async { Err::<(), _>(TransactionError::work("busy")) },
                TransactionOptions::new()
                    .max_retries(3)
                    .retry_delay_ms(5)
                    .max_backoff_ms(15),
            )
            .await;

        assert_eq!(*delays.lock(), vec![5, 10, 15]);
    }

    #[tokio::test]
    async fn test_before_commit_hook_error_fails_attempt() {
        let (store, manager, table) = setup();
        let failures_left = Arc::new(AtomicU32::new(1));

        let gate = failures_left.clone();
        manager.register_hooks(TransactionHooks::new().before_commit(move |_| {
            if gate.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                Err(TransactionError::work("audit log unavailable"))
            } else {
                Ok(())
            }
        }));

        let outcome = manager
            .execute_with_outcome(
                |ctx: Context| {
                    let table = table.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(table, json!({"sku": "C3"}))?)
                            .await?;
                        Ok(())
                    }
                },
                fast_retries(1),
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        // first attempt's insert compensated, second one kept
        assert_eq!(store.row_count(&TableName::new("orders").unwrap()), 1);
    }

    #[tokio::test]
    async fn test_after_commit_hook_error_compensates_and_retries() {
        let (store, manager, table) = setup();
        let failures_left = Arc::new(AtomicU32::new(1));

        let gate = failures_left.clone();
        manager.register_hooks(TransactionHooks::new().after_commit(move |_| {
            if gate.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                Err(TransactionError::work("after_commit failed"))
            } else {
                Ok(())
            }
        }));

        let outcome = manager
            .execute_with_outcome(
                |ctx: Context| {
                    let table = table.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(table, json!({"sku": "D4"}))?)
                            .await?;
                        Ok(7)
                    }
                },
                fast_retries(1),
            )
            .await
            .unwrap();

        assert_eq!(outcome.value, 7);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(store.row_count(&TableName::new("orders").unwrap()), 1);
        let stats = store.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 1);
    }

    #[tokio::test]
    async fn test_after_commit_hook_error_without_retries_fails() {
        let (store, manager, table) = setup();
        manager.register_hooks(
            TransactionHooks::new().after_commit(|_| Err(TransactionError::work("after_commit failed"))),
        );

        let err = manager
            .execute_with_options(
                |ctx: Context| {
                    let table = table.clone();
                    async move {
                        ctx.apply(InsertOperation::from_value(table, json!({"sku": "E5"}))?)
                            .await?;
                        Ok(7)
                    }
                },
                fast_retries(0),
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), Some(1));
        assert_eq!(err.last_attempt_error().to_string(), "after_commit failed");
        assert_eq!(store.row_count(&TableName::new("orders").unwrap()), 0);
        assert_eq!(store.stats().committed, 0);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_after_begin_hook_error_fails_attempt_and_retries() {
        let (_store, manager, _table) = setup();
        let failures_left = Arc::new(AtomicU32::new(2));
        let calls = Arc::new(AtomicU32::new(0));

        let gate = failures_left.clone();
        manager.register_hooks(TransactionHooks::new().after_begin(move |_| {
            if gate.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                Err(TransactionError::work("tracer unavailable"))
            } else {
                Ok(())
            }
        }));

        let counter = calls.clone();
        let outcome = manager
            .execute_with_outcome(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                fast_retries(3),
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        // work only ran once the hook let the attempt through
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_retry_hook_error_ends_execute() {
        let (store, manager, _table) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        manager.register_hooks(
            TransactionHooks::new().on_retry(|_| Err(TransactionError::work("retry budget denied"))),
        );

        let counter = calls.clone();
        let err = manager
            .execute_with_options(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(TransactionError::work("flaky"))
                    }
                },
                fast_retries(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::Work(ref msg) if msg == "retry budget denied"));
        assert_eq!(err.attempts(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().rolled_back, 1);

        let metrics = manager.recent_metrics();
        assert!(metrics[0].is_finished());
        assert!(!metrics[0].success);
    }

    #[tokio::test]
    async fn test_nested_commit_seals_child() {
        let (_store, manager, table) = setup();

        let root = manager.begin(None).await.unwrap();
        let child = manager.begin(Some(&root)).await.unwrap();
        child
            .apply(InsertOperation::from_value(table.clone(), json!({"sku": "S1"})).unwrap())
            .await
            .unwrap();
        manager.commit(&child).await.unwrap();

        let late = child
            .apply(InsertOperation::from_value(table.clone(), json!({"sku": "S2"})).unwrap())
            .await;
        assert!(matches!(late, Err(TransactionError::IllegalState(_))));
        assert_eq!(root.operation_count(), 1);
        assert!(!manager.is_active(child.id()));

        manager.rollback(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_commit_hands_operations_to_parent() {
        let (store, manager, table) = setup();

        let root = manager.begin(None).await.unwrap();
        let child = manager.begin(Some(&root)).await.unwrap();
        assert_eq!(child.depth(), 1);
        assert_eq!(manager.active_count(), 2);

        child
            .apply(InsertOperation::from_value(table.clone(), json!({"sku": "N1"})).unwrap())
            .await
            .unwrap();
        manager.commit(&child).await.unwrap();
        assert!(child.is_completed());
        assert_eq!(root.operation_count(), 1);
        assert_eq!(store.stats().committed, 0);

        let report = manager.rollback(&root).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(store.row_count(&table), 0);
        assert_eq!(store.stats().rolled_back, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_root_commit() {
        let (store, manager, table) = setup();

        let root = manager.begin(None).await.unwrap();
        root.apply(InsertOperation::from_value(table.clone(), json!({"sku": "M1"})).unwrap())
            .await
            .unwrap();
        manager.commit(&root).await.unwrap();

        assert_eq!(store.stats().committed, 1);
        assert_eq!(store.row_count(&table), 1);
        assert!(matches!(
            manager.commit(&root).await,
            Err(TransactionError::IllegalState(_))
        ));
        // rollback after completion is a no-op
        let report = manager.rollback(&root).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(store.row_count(&table), 1);
    }

    #[tokio::test]
    async fn test_nested_commit_rejected_after_parent_rollback() {
        let (_store, manager, _table) = setup();

        let root = manager.begin(None).await.unwrap();
        let child = manager.begin(Some(&root)).await.unwrap();
        manager.rollback(&root).await.unwrap();

        let err = manager.commit(&child).await.unwrap_err();
        assert!(matches!(err, TransactionError::IllegalState(_)));
        assert!(!child.is_completed());
        assert!(manager.begin(Some(&root)).await.is_err());

        manager.rollback(&child).await.unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_root_cannot_be_committed_manually() {
        let (_store, manager, _table) = setup();

        let inner = manager.clone();
        manager
            .execute(move |ctx: Context| {
                let manager = inner.clone();
                async move {
                    let err = manager.commit(&ctx).await.unwrap_err();
                    assert!(matches!(err, TransactionError::IllegalState(_)));
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_executions() {
        let (store, manager, table) = setup();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let manager = manager.clone();
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .execute(move |ctx: Context| {
                        let table = table.clone();
                        async move {
                            ctx.apply(InsertOperation::from_value(table, json!({"n": i}))?)
                                .await?;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(i)
                        }
                    })
                    .await
            }));
        }

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap().unwrap());
        }
        values.sort();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert_eq!(store.row_count(&table), 10);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.recent_metrics().len(), 10);
    }

    #[tokio::test]
    async fn test_metrics_retention_evicts_oldest() {
        let store = MemoryStore::new();
        let manager = TransactionManager::with_config(
            store,
            ManagerConfig::new().metrics_retention(2),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let outcome = manager
                .execute_with_outcome(|_ctx| async { Ok(()) }, TransactionOptions::default())
                .await
                .unwrap();
            ids.push(outcome.transaction_id);
        }

        let kept: Vec<String> = manager
            .recent_metrics()
            .into_iter()
            .map(|m| m.transaction_id)
            .collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert!(manager.metrics(&ids[0]).is_none());
    }

    #[test]
    fn test_config_from_json() {
        let config = ManagerConfig::from_json(
            r#"{"default_options": {"max_retries": 5}, "metrics_retention": 10}"#,
        )
        .unwrap();
        assert_eq!(config.default_options.max_retries, 5);
        assert_eq!(config.default_options.retry_delay_ms, 100);
        assert_eq!(config.metrics_retention, 10);

        assert!(ManagerConfig::from_json(r#"{"default_options": {"timeout_ms": 0}}"#).is_err());
    }
}
