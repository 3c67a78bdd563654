//! Transaction error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while coordinating a unit of work.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Malformed transaction options.
    #[error("invalid transaction options: {0}")]
    Validation(String),

    /// An attempt exceeded its time budget.
    #[error("transaction {tx_id} attempt timed out after {timeout_ms}ms")]
    Timeout { tx_id: String, timeout_ms: u64 },

    /// The underlying storage primitive failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Every attempt failed; wraps the last attempt's error.
    #[error("transaction {tx_id} failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        tx_id: String,
        attempts: u32,
        #[source]
        source: Box<TransactionError>,
    },

    /// Operation registered on a completed context, or commit/rollback of
    /// an unknown or completed context.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Failure raised by caller-supplied work, operations or hooks.
    #[error("{0}")]
    Work(String),
}

impl TransactionError {
    /// Create a caller failure from anything printable.
    pub fn work(message: impl Into<String>) -> Self {
        Self::Work(message.into())
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Check if a failed attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransactionError::Validation(_) | TransactionError::IllegalState(_)
        )
    }

    /// The error of the final attempt, looking through `RetryExhausted`.
    pub fn last_attempt_error(&self) -> &TransactionError {
        match self {
            TransactionError::RetryExhausted { source, .. } => source.last_attempt_error(),
            other => other,
        }
    }

    /// Check if the final attempt timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.last_attempt_error(), TransactionError::Timeout { .. })
    }

    /// Number of attempts made, when all of them failed.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            TransactionError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(TransactionError::work("boom").is_retryable());
        assert!(TransactionError::Timeout {
            tx_id: "tx1".to_string(),
            timeout_ms: 50,
        }
        .is_retryable());
        assert!(TransactionError::Storage(StorageError::BeginFailed("down".into())).is_retryable());

        assert!(!TransactionError::Validation("timeout_ms".into()).is_retryable());
        assert!(!TransactionError::illegal_state("completed").is_retryable());
    }

    #[test]
    fn test_last_attempt_error_unwraps() {
        let err = TransactionError::RetryExhausted {
            tx_id: "tx1".to_string(),
            attempts: 1,
            source: Box::new(TransactionError::Timeout {
                tx_id: "tx1".to_string(),
                timeout_ms: 50,
            }),
        };
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), Some(1));
        assert!(err.to_string().contains("after 1 attempt(s)"));
        assert!(err.to_string().contains("timed out after 50ms"));

        let plain = TransactionError::work("attempt 3");
        assert_eq!(plain.last_attempt_error().to_string(), "attempt 3");
        assert_eq!(plain.attempts(), None);
    }
}
