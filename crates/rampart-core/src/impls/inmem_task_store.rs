//! In-memory TaskStore implementation.
//!
//! Process-local: records live in a single `Mutex`-guarded map, so every
//! transition on a record is serialized. Queue structures (ready / scheduled)
//! hold TaskIds only; the record map is the single source of truth.

use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::{TaskId, TaskRecord, TaskState};
use crate::error::RampartError;
use crate::ports::clock::add_duration;
use crate::ports::{Clock, FailOutcome, QueueCounts, TaskLease, TaskStore};

/// Upper bound used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Scheduled (Delayed) entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap on (due, seq): earliest
/// first, and FIFO among entries due at the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    due: Instant,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Per-queue structures.
#[derive(Default)]
struct Lane {
    ready: VecDeque<TaskId>,
    scheduled: BinaryHeap<ScheduledTask>,
}

struct InMemoryState {
    records: HashMap<TaskId, TaskRecord>,
    lanes: HashMap<String, Lane>,
    next_seq: u64,
}

impl InMemoryState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            lanes: HashMap::new(),
            next_seq: 0,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Move Delayed tasks whose time has come back to the ready queue.
    fn promote_due(&mut self, queue: &str, now: Instant) {
        let Some(lane) = self.lanes.get_mut(queue) else {
            return;
        };
        while let Some(entry) = lane.scheduled.peek() {
            if entry.due > now {
                break;
            }
            let Some(entry) = lane.scheduled.pop() else {
                break;
            };
            // cancel 済みのレコードはここで読み飛ばす
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.state == TaskState::Delayed
            {
                record.requeue();
                lane.ready.push_back(entry.task_id);
            }
        }
    }

    /// Pop the first ready id whose record is still Pending.
    fn pop_ready(&mut self, queue: &str) -> Option<TaskId> {
        let lane = self.lanes.get_mut(queue)?;
        while let Some(task_id) = lane.ready.pop_front() {
            if self
                .records
                .get(&task_id)
                .is_some_and(|r| r.state == TaskState::Pending)
            {
                return Some(task_id);
            }
        }
        None
    }

    fn next_due(&self, queue: &str) -> Option<Instant> {
        self.lanes
            .get(queue)
            .and_then(|lane| lane.scheduled.peek())
            .map(|entry| entry.due)
    }

    /// Active record held by the lease for `attempt`, or InvalidTransition.
    fn leased_record_mut(
        &mut self,
        task_id: TaskId,
        attempt: u32,
    ) -> Result<&mut TaskRecord, RampartError> {
        let record = self
            .records
            .get_mut(&task_id)
            .ok_or(RampartError::TaskNotFound(task_id))?;
        if record.state != TaskState::Active || record.attempts != attempt {
            return Err(RampartError::InvalidTransition {
                id: task_id,
                state: record.state,
            });
        }
        Ok(record)
    }
}

/// In-memory task store.
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryState>>,
    notifiers: DashMap<String, Arc<Notify>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::new())),
            notifiers: DashMap::new(),
            clock,
        }
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        if let Some(notify) = self.notifiers.get(queue) {
            return Arc::clone(&notify);
        }
        Arc::clone(
            &self
                .notifiers
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), RampartError> {
        let queue = record.queue.clone();
        {
            let mut state = self.state.lock().await;
            let task_id = record.id;
            state.records.insert(task_id, record);
            state
                .lanes
                .entry(queue.clone())
                .or_default()
                .ready
                .push_back(task_id);
        }

        // Notify outside the lock
        self.notifier(&queue).notify_one();
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Box<dyn TaskLease>, RampartError> {
        let notify = self.notifier(queue);
        loop {
            // 先に待機登録してから状態を見る（その間の notify を取りこぼさない）
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(queue, Instant::now());

                if let Some(task_id) = state.pop_ready(queue)
                    && let Some(record) = state.records.get_mut(&task_id)
                {
                    record.start_attempt(self.clock.now());
                    trace!(task_id = %task_id, queue, attempt = record.attempts, "claimed");
                    return Ok(Box::new(InMemoryLease {
                        record: record.clone(),
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&notify),
                        clock: Arc::clone(&self.clock),
                    }));
                }

                state.next_due(queue)
            };

            // Wait for a push OR the next scheduled task time
            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(due) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn get(&self, id: TaskId) -> Option<TaskRecord> {
        let state = self.state.lock().await;
        state.records.get(&id).cloned()
    }

    async fn cancel(&self, id: TaskId) -> Result<TaskRecord, RampartError> {
        let mut state = self.state.lock().await;
        let current = state
            .records
            .get(&id)
            .map(|r| r.state)
            .ok_or(RampartError::TaskNotFound(id))?;
        if !current.is_waiting() {
            return Err(RampartError::NotCancellable { id, state: current });
        }
        // ready / scheduled 側の id は claim 時に読み飛ばされる
        state
            .records
            .remove(&id)
            .ok_or(RampartError::TaskNotFound(id))
    }

    async fn counts(&self, queue: &str) -> QueueCounts {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values().filter(|r| r.queue == queue) {
            counts.record(record.state);
        }
        counts
    }

    async fn counts_by_queue(&self) -> Vec<(String, QueueCounts)> {
        let state = self.state.lock().await;
        let mut by_queue: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for record in state.records.values() {
            by_queue
                .entry(record.queue.clone())
                .or_default()
                .record(record.state);
        }
        by_queue.into_iter().collect()
    }
}

/// Lease implementation for InMemoryTaskStore.
struct InMemoryLease {
    record: TaskRecord,
    state: Arc<Mutex<InMemoryState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn record(&self) -> &TaskRecord {
        &self.record
    }

    async fn complete(
        self: Box<Self>,
        result: serde_json::Value,
    ) -> Result<TaskRecord, RampartError> {
        let mut state = self.state.lock().await;
        let record = state.leased_record_mut(self.record.id, self.record.attempts)?;
        record.mark_completed(result, self.clock.now());
        Ok(record.clone())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, RampartError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let seq = state.allocate_seq();
            let now = self.clock.now();
            let record = state.leased_record_mut(self.record.id, self.record.attempts)?;

            if !record.retries_left() {
                record.mark_failed(error, now);
                return Ok(FailOutcome::Exhausted(record.clone()));
            }

            let delay = record.backoff.next_delay(record.attempts);
            let started = Instant::now();
            let due = started
                .checked_add(delay)
                .unwrap_or_else(|| started + FAR_FUTURE);
            record.schedule_retry(add_duration(now, delay), error);
            debug!(
                task_id = %record.id,
                attempts = record.attempts,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );
            let snapshot = record.clone();

            state
                .lanes
                .entry(snapshot.queue.clone())
                .or_default()
                .scheduled
                .push(ScheduledTask {
                    due,
                    seq,
                    task_id: snapshot.id,
                });
            FailOutcome::RetryScheduled(snapshot)
        }; // Lock released here

        // 待機中のワーカーに次の起床時刻を再計算させる
        self.notify.notify_one();
        Ok(outcome)
    }
}
