//! Recorded lifecycle events and queries over them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transaction::{HookContext, TransactionMetrics};

/// Kind of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Begin,
    Commit,
    Rollback,
    Retry,
    Timeout,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Begin => "begin",
            EventKind::Commit => "commit",
            EventKind::Rollback => "rollback",
            EventKind::Retry => "retry",
            EventKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event. Events are never changed after being recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub kind: EventKind,
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TransactionMetrics>,
}

impl TransactionEvent {
    pub fn new(kind: EventKind, transaction_id: impl Into<String>) -> Self {
        Self {
            kind,
            transaction_id: transaction_id.into(),
            timestamp: Utc::now(),
            duration_ms: None,
            error: None,
            metadata: BTreeMap::new(),
            metrics: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build the event for a hook invocation.
    pub(crate) fn from_hook(kind: EventKind, ctx: &HookContext) -> Self {
        let mut event = Self::new(kind, ctx.transaction_id.clone())
            .with_metadata("attempt", json!(ctx.attempt));
        event.timestamp = ctx.timestamp;
        event.error = ctx.error.clone();
        event.metrics = Some(ctx.metrics.clone());

        match kind {
            EventKind::Begin => {
                event = event.with_metadata("isolation_level", json!(ctx.isolation_level));
                event = event.with_metadata("read_only", json!(ctx.read_only));
            }
            EventKind::Commit => {
                event.duration_ms = ctx.metrics.duration_ms;
                event = event.with_metadata("operations", json!(ctx.operations));
            }
            EventKind::Rollback => {
                event.duration_ms = ctx.metrics.duration_ms;
                event = event.with_metadata("operations", json!(ctx.operations));
                if let Some(report) = &ctx.compensation {
                    event = event
                        .with_metadata("compensated", json!(report.attempted))
                        .with_metadata("compensation_failures", json!(report.failed()));
                    if !report.is_clean() {
                        event = event.with_metadata("failed_compensations", json!(report.failures));
                    }
                }
            }
            EventKind::Retry => {
                if let Some(delay_ms) = ctx.delay_ms {
                    event = event.with_metadata("delay_ms", json!(delay_ms));
                }
            }
            EventKind::Timeout => {}
        }

        if let Some(context_id) = &ctx.context_id {
            event = event.with_metadata("context_id", json!(context_id));
        }
        event
    }
}

/// Query over recorded events. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub transaction_id: Option<String>,
    pub kind: Option<EventKind>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &TransactionEvent) -> bool {
        self.transaction_id
            .as_deref()
            .map_or(true, |id| event.transaction_id == id)
            && self.kind.map_or(true, |kind| event.kind == kind)
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
    }
}
