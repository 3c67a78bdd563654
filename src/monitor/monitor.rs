//! Transaction monitor - observes a manager through its hooks.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::monitor::error::{MonitorError, MonitorResult};
use crate::monitor::event::{EventFilter, EventKind, TransactionEvent};
use crate::storage::StorageProvider;
use crate::transaction::{HookContext, TransactionHooks, TransactionManager, TransactionMetrics};

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum number of events kept; the oldest are evicted first.
    pub capacity: usize,
    /// Maximum number of transactions whose metrics are kept; the oldest
    /// finished ones are evicted first.
    pub metrics_retention: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            metrics_retention: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> MonitorResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn metrics_retention(mut self, retention: usize) -> Self {
        self.metrics_retention = retention;
        self
    }

    pub fn validate(&self) -> MonitorResult<()> {
        if self.capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.metrics_retention == 0 {
            return Err(MonitorError::InvalidConfig(
                "metrics_retention must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Aggregates over the transactions the monitor has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatistics {
    /// Finished transactions, successful or not.
    pub total_transactions: usize,
    pub successful_transactions: usize,
    pub failed_transactions: usize,
    /// Begun but not finished, including ones waiting for a retry.
    pub in_flight: usize,
    pub average_duration_ms: f64,
    pub total_retries: u64,
    /// Share of finished transactions that needed at least one retry.
    pub retry_rate: f64,
}

/// Callback receiving every event recorded after it subscribed.
pub type EventListener = Arc<dyn Fn(&TransactionEvent) + Send + Sync>;

/// Records lifecycle events into a bounded history.
///
/// Thread-safe: can be shared via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: MonitorConfig,
    state: RwLock<MonitorState>,
    listeners: RwLock<Vec<(u64, EventListener)>>,
    next_listener_id: AtomicU64,
}

#[derive(Default)]
struct MonitorState {
    events: VecDeque<TransactionEvent>,
    metrics: HashMap<String, TransactionMetrics>,
    /// Transaction ids in first-seen order.
    metrics_order: VecDeque<String>,
}

impl MonitorState {
    fn upsert_metrics(&mut self, metrics: TransactionMetrics, retention: usize) {
        let id = metrics.transaction_id.clone();
        if self.metrics.insert(id.clone(), metrics).is_none() {
            self.metrics_order.push_back(id);
        }

        while self.metrics.len() > retention {
            let oldest_finished = self
                .metrics_order
                .iter()
                .position(|id| self.metrics.get(id).map_or(true, |m| m.is_finished()));
            let Some(position) = oldest_finished else {
                break;
            };
            if let Some(id) = self.metrics_order.remove(position) {
                self.metrics.remove(&id);
            }
        }
    }
}

/// Handle returned by [`TransactionMonitor::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivering events to the listener. Returns false if the monitor
    /// is gone or the listener was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(monitor) = self.monitor.upgrade() else {
            return false;
        };
        let mut listeners = monitor.listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}

#[derive(Serialize)]
struct MetricsExport<'a> {
    exported_at: DateTime<Utc>,
    statistics: TransactionStatistics,
    metrics: Vec<&'a TransactionMetrics>,
    events: Vec<&'a TransactionEvent>,
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::from_valid_config(MonitorConfig::default())
    }
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MonitorConfig) -> MonitorResult<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                state: RwLock::new(MonitorState::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Hooks that feed this monitor, for `TransactionManager::register_hooks`.
    pub fn hooks(&self) -> TransactionHooks {
        let observe = |kind: EventKind| {
            let monitor = self.clone();
            move |ctx: &HookContext| {
                monitor.record(TransactionEvent::from_hook(kind, ctx));
                Ok(())
            }
        };

        TransactionHooks::new()
            .after_begin(observe(EventKind::Begin))
            .after_commit(observe(EventKind::Commit))
            .after_rollback(observe(EventKind::Rollback))
            .on_retry(observe(EventKind::Retry))
            .on_timeout(observe(EventKind::Timeout))
    }

    /// Start observing `manager`.
    pub fn attach<S: StorageProvider>(&self, manager: &TransactionManager<S>) {
        manager.register_hooks(self.hooks());
    }

    /// Append an event, then deliver it to every listener.
    pub fn record(&self, event: TransactionEvent) {
        {
            let mut state = self.inner.state.write();
            if let Some(metrics) = &event.metrics {
                state.upsert_metrics(metrics.clone(), self.inner.config.metrics_retention);
            }
            state.events.push_back(event.clone());
            while state.events.len() > self.inner.config.capacity {
                state.events.pop_front();
            }
        }

        tracing::debug!(
            transaction_id = %event.transaction_id,
            kind = %event.kind,
            "event recorded"
        );

        let listeners: Vec<(u64, EventListener)> = self.inner.listeners.read().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(
                    listener_id = id,
                    transaction_id = %event.transaction_id,
                    kind = %event.kind,
                    "event listener panicked"
                );
            }
        }
    }

    /// Events matching `filter`, oldest first.
    pub fn events(&self, filter: &EventFilter) -> Vec<TransactionEvent> {
        let state = self.inner.state.read();
        let mut matched: Vec<TransactionEvent> = state
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn event_count(&self) -> usize {
        self.inner.state.read().events.len()
    }

    /// Register a listener for events recorded from now on.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Latest metrics seen for a transaction.
    pub fn metrics_for(&self, transaction_id: &str) -> Option<TransactionMetrics> {
        self.inner.state.read().metrics.get(transaction_id).cloned()
    }

    pub fn statistics(&self) -> TransactionStatistics {
        let state = self.inner.state.read();
        Self::compute_statistics(state.metrics.values())
    }

    fn compute_statistics<'a>(
        metrics: impl Iterator<Item = &'a TransactionMetrics>,
    ) -> TransactionStatistics {
        let mut stats = TransactionStatistics::default();
        let mut total_duration: u64 = 0;
        let mut retried: usize = 0;

        for m in metrics {
            if !m.is_finished() {
                stats.in_flight += 1;
                continue;
            }
            stats.total_transactions += 1;
            if m.success {
                stats.successful_transactions += 1;
            } else {
                stats.failed_transactions += 1;
            }
            total_duration += m.duration_ms.unwrap_or(0);
            stats.total_retries += u64::from(m.retry_count);
            if m.retry_count > 0 {
                retried += 1;
            }
        }

        if stats.total_transactions > 0 {
            let total = stats.total_transactions as f64;
            stats.average_duration_ms = total_duration as f64 / total;
            stats.retry_rate = retried as f64 / total;
        }
        stats
    }

    /// JSON snapshot of statistics, per-transaction metrics and history.
    pub fn export_metrics(&self) -> MonitorResult<String> {
        let state = self.inner.state.read();
        let mut metrics: Vec<&TransactionMetrics> = state.metrics.values().collect();
        metrics.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });

        let export = MetricsExport {
            exported_at: Utc::now(),
            statistics: Self::compute_statistics(metrics.iter().copied()),
            metrics,
            events: state.events.iter().collect(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Forget all events and metrics. Listeners stay subscribed.
    pub fn clear_history(&self) {
        let mut state = self.inner.state.write();
        state.events.clear();
        state.metrics.clear();
        state.metrics_order.clear();
    }
}

impl std::fmt::Debug for TransactionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMonitor")
            .field("capacity", &self.capacity())
            .field("events", &self.event_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
