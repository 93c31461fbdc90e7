use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{HandlerKey, TaskId, TaskState};
use crate::resilience::BreakerState;

/// Rejection returned by a breaker without running the wrapped operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("circuit {state} for key={key} (retry in {}ms)", cooldown_remaining.as_millis())]
pub struct CircuitOpenError {
    pub key: String,
    pub state: BreakerState,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_remaining: Duration,
}

/// Denial from the rate limiter, surfaced as an error when a caller asks for one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rate limit of {limit} exceeded for key={key} (resets at {reset_at})")]
pub struct RateLimitExceeded {
    pub key: String,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RampartError {
    /// Supplier or handler failed.
    #[error("compute failed: {0}")]
    Compute(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {id} failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        id: TaskId,
        attempts: u32,
        last_error: String,
    },

    #[error("handler not found for {0}")]
    HandlerNotFound(HandlerKey),

    #[error("duplicate handler for {0}")]
    DuplicateHandler(HandlerKey),

    #[error("task {id} is {state}, cannot apply transition")]
    InvalidTransition { id: TaskId, state: TaskState },

    #[error("task {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: TaskId, state: TaskState },

    #[error("config: {0}")]
    Config(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RampartError {
    pub fn compute(message: impl fmt::Display) -> Self {
        Self::Compute(message.to_string())
    }
}

impl From<::config::ConfigError> for RampartError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_error_keeps_message() {
        let err = RampartError::compute("upstream 503");
        assert_eq!(err.to_string(), "compute failed: upstream 503");
    }

    #[test]
    fn circuit_open_error_reports_state_and_remaining() {
        let err = CircuitOpenError {
            key: "user-1".into(),
            state: BreakerState::Open,
            opened_at: None,
            cooldown_remaining: Duration::from_millis(1500),
        };
        let msg = RampartError::from(err).to_string();
        assert!(msg.contains("open"));
        assert!(msg.contains("user-1"));
        assert!(msg.contains("1500ms"));
    }
}
