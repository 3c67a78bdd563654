//! Monitor error types.

use thiserror::Error;

/// Result type for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),
}
