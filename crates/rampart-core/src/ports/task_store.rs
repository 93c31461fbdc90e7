//! TaskStore port - タスク状態の正本（source of truth）
//!
//! 状態遷移（claim / complete / fail / cancel）はすべてここを通り、
//! 1 レコードに対する遷移はストア内で直列化される。
//! 具体的な永続化（RDB など）は外部の実装に任せる。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskRecord, TaskState};
use crate::error::RampartError;

/// Counts by state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Active => self.active += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Delayed => self.delayed += 1,
        }
    }

    pub fn merge(&mut self, other: &QueueCounts) {
        self.pending += other.pending;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
        self.delayed += other.delayed;
    }

    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed + self.failed + self.delayed
    }
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Delayed with a run_after; another attempt will follow.
    RetryScheduled(TaskRecord),

    /// max_attempts reached; terminal.
    Exhausted(TaskRecord),
}

impl FailOutcome {
    pub fn record(&self) -> &TaskRecord {
        match self {
            FailOutcome::RetryScheduled(r) | FailOutcome::Exhausted(r) => r,
        }
    }
}

/// A claimed task.
///
/// The worker owns this lease for exactly one attempt and must either
/// `complete` or `fail` it. The store decides retry vs terminal failure.
#[async_trait]
pub trait TaskLease: Send {
    /// Snapshot taken at claim time (state = Active).
    fn record(&self) -> &TaskRecord;

    async fn complete(self: Box<Self>, result: serde_json::Value)
    -> Result<TaskRecord, RampartError>;

    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, RampartError>;
}

/// Storage interface for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new Pending record and make it visible to workers of its queue.
    async fn insert(&self, record: TaskRecord) -> Result<(), RampartError>;

    /// Claim the next eligible task of `queue` (Pending, or Delayed and due).
    ///
    /// Suspends until one is available; never busy-polls.
    async fn claim(&self, queue: &str) -> Result<Box<dyn TaskLease>, RampartError>;

    async fn get(&self, id: TaskId) -> Option<TaskRecord>;

    /// Remove a Pending/Delayed task before any worker claims it.
    async fn cancel(&self, id: TaskId) -> Result<TaskRecord, RampartError>;

    async fn counts(&self, queue: &str) -> QueueCounts;

    /// Counts for every queue that has at least one record.
    async fn counts_by_queue(&self) -> Vec<(String, QueueCounts)>;
}
