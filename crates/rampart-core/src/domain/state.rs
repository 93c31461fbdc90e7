//! Task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Active -> Completed
/// - Pending -> Active -> Delayed -> Pending (retry with backoff, until max_attempts)
/// - Pending -> Active -> Failed (max_attempts reached)
///
/// Pending / Delayed tasks can be cancelled (removed) before a worker claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready to be claimed.
    Pending,

    /// Held by exactly one worker for one attempt.
    Active,

    Completed,

    /// Waiting for `run_after` (retry backoff).
    Delayed,

    /// Terminal after exhausting max_attempts.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Can a worker claim it (once due, for Delayed)?
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Delayed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Delayed => "delayed",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
