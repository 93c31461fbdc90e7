//! Task record: the single source of truth for one unit of work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackoffPolicy, TaskId, TaskState};

/// Default ceiling on execution attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identifies a handler: logical queue + task name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerKey {
    pub queue: String,
    pub name: String,
}

impl HandlerKey {
    pub fn new(queue: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.name)
    }
}

/// Producer-side overrides; unset fields fall back to the runtime defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Snapshot of a task.
///
/// Stores hold these records and hand out clones; only the worker holding the
/// current lease mutates one (through the store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: TaskState,

    /// Attempts started so far (including the current one while Active).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,

    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,

    /// Earliest time a Delayed task may run again.
    pub run_after: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        key: HandlerKey,
        payload: serde_json::Value,
        max_attempts: u32,
        backoff: BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: key.queue,
            name: key.name,
            payload,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            backoff,
            result: None,
            last_error: None,
            run_after: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn handler_key(&self) -> HandlerKey {
        HandlerKey::new(self.queue.clone(), self.name.clone())
    }

    /// Pending -> Active (increment attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Active;
        self.attempts += 1;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.result = Some(result);
        self.finished_at = Some(now);
    }

    /// Terminal failure (max_attempts reached).
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(now);
    }

    pub fn schedule_retry(&mut self, run_after: DateTime<Utc>, error: String) {
        self.state = TaskState::Delayed;
        self.run_after = Some(run_after);
        self.last_error = Some(error);
    }

    /// Delayed -> Pending once run_after has passed.
    pub fn requeue(&mut self) {
        self.state = TaskState::Pending;
        self.run_after = None;
    }

    pub fn retries_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn record(max_attempts: u32) -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            HandlerKey::new("enrichment", "lookup"),
            serde_json::json!({"email": "a@example.com"}),
            max_attempts,
            BackoffPolicy::default(),
            now,
        )
    }

    #[test]
    fn new_record_is_pending_without_attempts() {
        let r = record(3);
        assert_eq!(r.state, TaskState::Pending);
        assert_eq!(r.attempts, 0);
        assert!(r.started_at.is_none());
        assert_eq!(r.handler_key().to_string(), "enrichment/lookup");
    }

    #[test]
    fn zero_max_attempts_is_normalised() {
        assert_eq!(record(0).max_attempts, 1);
    }

    #[test]
    fn retry_cycle_keeps_error_and_clears_run_after() {
        let mut r = record(2);
        let now = r.created_at;
        r.start_attempt(now);
        assert!(r.retries_left());

        r.schedule_retry(now + chrono::Duration::seconds(2), "boom".into());
        assert_eq!(r.state, TaskState::Delayed);
        assert!(r.run_after.is_some());

        r.requeue();
        assert_eq!(r.state, TaskState::Pending);
        assert!(r.run_after.is_none());
        assert_eq!(r.last_error.as_deref(), Some("boom"));

        r.start_attempt(now);
        assert!(!r.retries_left());
        r.mark_failed("boom again".into(), now);
        assert_eq!(r.state, TaskState::Failed);
        assert_eq!(r.attempts, 2);
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn options_builder_sets_fields() {
        let opts = EnqueueOptions::default()
            .max_attempts(5)
            .backoff(BackoffPolicy::fixed(std::time::Duration::from_secs(1)));
        assert_eq!(opts.max_attempts, Some(5));
        assert!(matches!(opts.backoff, Some(BackoffPolicy::Fixed { delay_ms: 1000 })));
    }
}
