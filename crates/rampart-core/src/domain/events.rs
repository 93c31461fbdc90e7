//! Events - タスクのライフサイクルイベント
//!
//! Runtime が broadcast channel に流し、呼び出し側は subscribe して完了通知を受け取る。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Enqueued {
        id: TaskId,
        queue: String,
        name: String,
    },
    Started {
        id: TaskId,
        attempt: u32,
    },
    Completed {
        id: TaskId,
        attempts: u32,
    },
    RetryScheduled {
        id: TaskId,
        attempts: u32,
        run_after: DateTime<Utc>,
        error: String,
    },
    Failed {
        id: TaskId,
        attempts: u32,
        error: String,
    },
    Cancelled {
        id: TaskId,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            DomainEvent::Enqueued { id, .. }
            | DomainEvent::Started { id, .. }
            | DomainEvent::Completed { id, .. }
            | DomainEvent::RetryScheduled { id, .. }
            | DomainEvent::Failed { id, .. }
            | DomainEvent::Cancelled { id } => *id,
        }
    }

    /// No further events follow for this task.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DomainEvent::Completed { .. } | DomainEvent::Failed { .. } | DomainEvent::Cancelled { .. }
        )
    }
}
