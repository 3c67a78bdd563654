//! Per-transaction metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics for one `execute()` call, updated across attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub transaction_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    /// Retries performed so far (attempts minus one).
    pub retry_count: u32,
    /// Operations registered in the latest attempt.
    pub operations_count: usize,
    /// Message of the latest failure; cleared on success.
    pub error: Option<String>,
}

impl TransactionMetrics {
    pub fn start(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            success: false,
            retry_count: 0,
            operations_count: 0,
            error: None,
        }
    }

    /// Whether an end time has been recorded.
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub(crate) fn record_success(&mut self) {
        self.success = true;
        self.error = None;
        self.stamp_end();
    }

    pub(crate) fn record_failure(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.stamp_end();
    }

    /// Clear the end stamp of a failed attempt that is about to be retried.
    pub(crate) fn reopen(&mut self) {
        self.end_time = None;
        self.duration_ms = None;
    }

    fn stamp_end(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(now);
        self.duration_ms = Some(elapsed);
    }
}
