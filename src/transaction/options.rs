//! Per-call transaction options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

/// Retry, timeout and isolation settings for one `execute()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// Retries after the first attempt; `max_retries + 1` attempts at most.
    pub max_retries: u32,
    /// Base delay between attempts.
    pub retry_delay_ms: u64,
    /// Double the delay after every failed attempt.
    pub exponential_backoff: bool,
    /// Upper bound for the exponential delay.
    pub max_backoff_ms: u64,
    /// Budget for a single attempt, begin through commit.
    pub timeout_ms: u64,
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            exponential_backoff: true,
            max_backoff_ms: 10_000,
            timeout_ms: 30_000,
            isolation_level: IsolationLevel::ReadCommitted,
            read_only: false,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> TransactionResult<Self> {
        serde_json::from_str(json).map_err(|e| TransactionError::Validation(e.to_string()))
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    pub fn retry_delay_ms(mut self, value: u64) -> Self {
        self.retry_delay_ms = value;
        self
    }

    pub fn exponential_backoff(mut self, value: bool) -> Self {
        self.exponential_backoff = value;
        self
    }

    pub fn max_backoff_ms(mut self, value: u64) -> Self {
        self.max_backoff_ms = value;
        self
    }

    pub fn timeout_ms(mut self, value: u64) -> Self {
        self.timeout_ms = value;
        self
    }

    pub fn isolation_level(mut self, value: IsolationLevel) -> Self {
        self.isolation_level = value;
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Reject options that cannot drive a retry loop.
    pub fn validate(&self) -> TransactionResult<()> {
        if self.timeout_ms == 0 {
            return Err(TransactionError::Validation(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.exponential_backoff && self.max_backoff_ms < self.retry_delay_ms {
            return Err(TransactionError::Validation(format!(
                "max_backoff_ms ({}) must not be below retry_delay_ms ({})",
                self.max_backoff_ms, self.retry_delay_ms
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `min(retry_delay_ms * 2^(retry-1), max_backoff_ms)` with exponential
    /// backoff, `retry_delay_ms` otherwise.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return Duration::from_millis(self.retry_delay_ms);
        }
        // cap the shift to prevent overflow
        let shift = retry.saturating_sub(1).min(63);
        let delay_ms = self.retry_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}
