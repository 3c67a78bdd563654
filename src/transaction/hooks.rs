//! Lifecycle hooks.
//!
//! Every phase owns an ordered chain of callbacks. Registering more hooks
//! for a phase appends to its chain; callbacks run in registration order
//! and the first error stops the chain.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transaction::context::CompensationReport;
use crate::transaction::error::TransactionResult;
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::metrics::TransactionMetrics;

/// Lifecycle phase a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    BeforeBegin,
    AfterBegin,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
    OnRetry,
    OnTimeout,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeBegin => "before_begin",
            HookPhase::AfterBegin => "after_begin",
            HookPhase::BeforeCommit => "before_commit",
            HookPhase::AfterCommit => "after_commit",
            HookPhase::BeforeRollback => "before_rollback",
            HookPhase::AfterRollback => "after_rollback",
            HookPhase::OnRetry => "on_retry",
            HookPhase::OnTimeout => "on_timeout",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub phase: HookPhase,
    pub transaction_id: String,
    /// Absent when the attempt failed before a context existed.
    pub context_id: Option<String>,
    pub depth: usize,
    /// 1-based attempt number. For `on_retry` this is the retry about to
    /// happen (1 for the first retry).
    pub attempt: u32,
    pub operations: usize,
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
    pub metrics: TransactionMetrics,
    pub error: Option<String>,
    /// Backoff before the next attempt, on `on_retry`.
    pub delay_ms: Option<u64>,
    /// Outcome of compensation, on `after_rollback`.
    pub compensation: Option<CompensationReport>,
    pub timestamp: DateTime<Utc>,
}

/// A lifecycle callback. Returning an error from a `before_*` or
/// `after_begin` hook fails the current attempt.
pub type Hook = Arc<dyn Fn(&HookContext) -> TransactionResult<()> + Send + Sync>;

/// A set of hooks to merge into a manager with `register_hooks`.
#[derive(Clone, Default)]
pub struct TransactionHooks {
    hooks: Vec<(HookPhase, Hook)>,
}

impl TransactionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `hook` to `phase`.
    pub fn on<F>(mut self, phase: HookPhase, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.hooks.push((phase, Arc::new(hook)));
        self
    }

    pub fn before_begin<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::BeforeBegin, hook)
    }

    pub fn after_begin<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::AfterBegin, hook)
    }

    pub fn before_commit<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::BeforeCommit, hook)
    }

    pub fn after_commit<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::AfterCommit, hook)
    }

    pub fn before_rollback<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::BeforeRollback, hook)
    }

    pub fn after_rollback<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::AfterRollback, hook)
    }

    pub fn on_retry<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::OnRetry, hook)
    }

    pub fn on_timeout<F>(self, hook: F) -> Self
    where
        F: Fn(&HookContext) -> TransactionResult<()> + Send + Sync + 'static,
    {
        self.on(HookPhase::OnTimeout, hook)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for TransactionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(phase, _)| phase))
            .finish()
    }
}

/// Hook chains per phase, owned by a manager.
#[derive(Default)]
pub(crate) struct HookRegistry {
    chains: BTreeMap<HookPhase, Vec<Hook>>,
}

impl HookRegistry {
    /// Append every hook in `hooks` to its phase's chain.
    pub(crate) fn merge(&mut self, hooks: TransactionHooks) {
        for (phase, hook) in hooks.hooks {
            self.chains.entry(phase).or_default().push(hook);
        }
    }

    /// Snapshot of one phase's chain, so it can run without the lock.
    pub(crate) fn chain(&self, phase: HookPhase) -> Vec<Hook> {
        self.chains.get(&phase).cloned().unwrap_or_default()
    }

    pub(crate) fn count(&self, phase: HookPhase) -> usize {
        self.chains.get(&phase).map_or(0, Vec::len)
    }
}

/// Run a chain in order, stopping at the first error.
pub(crate) fn run_chain(chain: &[Hook], context: &HookContext) -> TransactionResult<()> {
    for hook in chain {
        hook(context)?;
    }
    Ok(())
}
