//! Runtime - producer / status API
//!
//! enqueue はタスクを Pending で保存した時点で TaskId を返す（実行は待たない）。
//! 実行結果が欲しい呼び出し側は `subscribe()` か `wait_for()` を使う。

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::status::StatusReport;
use crate::domain::{
    BackoffPolicy, DEFAULT_MAX_ATTEMPTS, DomainEvent, EnqueueOptions, HandlerKey, TaskId,
    TaskRecord, TaskState,
};
use crate::error::RampartError;
use crate::ports::{Clock, IdGenerator, QueueCounts, TaskStore};
use crate::typed::{HandlerRegistry, Task};

const EVENT_CAPACITY: usize = 1024;

/// Fallbacks for options the producer leaves unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefaults {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct Runtime {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: TaskDefaults,
    events: broadcast::Sender<DomainEvent>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        defaults: TaskDefaults,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            registry,
            ids,
            clock,
            defaults,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }

    /// Create a Pending task and return its id without waiting for execution.
    ///
    /// Fails with `HandlerNotFound` if nothing is registered for `(queue, name)`.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskId, RampartError> {
        let key = HandlerKey::new(queue, name);
        if !self.registry.contains(&key) {
            return Err(RampartError::HandlerNotFound(key));
        }

        let record = TaskRecord::new(
            self.ids.generate_task_id(),
            key,
            payload,
            options.max_attempts.unwrap_or(self.defaults.max_attempts),
            options.backoff.unwrap_or(self.defaults.backoff),
            self.clock.now(),
        );
        let id = record.id;

        // insert の時点でワーカーが起きるので、Started より先に Enqueued を流す
        self.publish(DomainEvent::Enqueued {
            id,
            queue: queue.to_string(),
            name: name.to_string(),
        });
        self.store.insert(record).await?;

        info!(task_id = %id, queue, task = name, "enqueued");
        Ok(id)
    }

    /// Typed enqueue: queue and name come from `T`.
    pub async fn enqueue_task<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<TaskId, RampartError> {
        let payload = serde_json::to_value(task)?;
        self.enqueue(T::QUEUE, T::NAME, payload, options).await
    }

    /// Snapshot of one task. Pure read.
    pub async fn get_job(&self, id: TaskId) -> Result<TaskRecord, RampartError> {
        self.store
            .get(id)
            .await
            .ok_or(RampartError::TaskNotFound(id))
    }

    pub async fn queue_counts(&self, queue: &str) -> QueueCounts {
        self.store.counts(queue).await
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport::from_counts(self.store.counts_by_queue().await)
    }

    /// Remove a Pending/Delayed task before a worker claims it.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskRecord, RampartError> {
        let record = self.store.cancel(id).await?;
        info!(task_id = %id, queue = %record.queue, "cancelled");
        self.publish(DomainEvent::Cancelled { id });
        Ok(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Wait until `id` is terminal.
    ///
    /// `Ok(result)` when completed, `Err(ExhaustedRetries)` when failed,
    /// `Err(TaskNotFound)` when unknown or cancelled.
    pub async fn wait_for(&self, id: TaskId) -> Result<serde_json::Value, RampartError> {
        // 先に subscribe してから状態を見る（その間の完了イベントを取りこぼさない）
        let mut rx = self.subscribe();
        loop {
            let record = self.get_job(id).await?;
            match record.state {
                TaskState::Completed => {
                    return Ok(record.result.unwrap_or(serde_json::Value::Null));
                }
                TaskState::Failed => {
                    return Err(RampartError::ExhaustedRetries {
                        id,
                        attempts: record.attempts,
                        last_error: record.last_error.unwrap_or_default(),
                    });
                }
                _ => {}
            }

            loop {
                match rx.recv().await {
                    Ok(event) if event.task_id() == id && event.is_final() => break,
                    Ok(_) => continue,
                    // 取りこぼした可能性があるのでストアを読み直す
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RampartError::TaskNotFound(id));
                    }
                }
            }
        }
    }

    pub(crate) fn publish(&self, event: DomainEvent) {
        // 受信者がいなければ捨てる
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::json;

    fn runtime() -> Runtime {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("enrichment", "lookup", |p| async move { Ok::<_, RampartError>(p) })
            .unwrap();
        Runtime::new(
            Arc::new(InMemoryTaskStore::new(Arc::clone(&clock))),
            Arc::new(registry),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            TaskDefaults::default(),
        )
    }

    #[tokio::test]
    async fn enqueue_creates_pending_record_with_defaults() {
        let rt = runtime();
        let id = rt
            .enqueue("enrichment", "lookup", json!({"email": "a@b.c"}), EnqueueOptions::default())
            .await
            .unwrap();

        let record = rt.get_job(id).await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(record.backoff, BackoffPolicy::default());
        assert_eq!(rt.queue_counts("enrichment").await.pending, 1);
    }

    #[tokio::test]
    async fn enqueue_without_handler_is_rejected() {
        let rt = runtime();
        let err = rt
            .enqueue("enrichment", "missing", json!(null), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RampartError::HandlerNotFound(ref k) if k.name == "missing"));
        assert_eq!(rt.status().await.totals.total(), 0);
    }

    #[tokio::test]
    async fn zero_max_attempts_becomes_one() {
        let rt = runtime();
        let id = rt
            .enqueue("enrichment", "lookup", json!(1), EnqueueOptions::default().max_attempts(0))
            .await
            .unwrap();
        assert_eq!(rt.get_job(id).await.unwrap().max_attempts, 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let rt = runtime();
        let id = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(rt.get_job(id).await, Err(RampartError::TaskNotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn cancel_removes_pending_and_emits_event() {
        let rt = runtime();
        let mut events = rt.subscribe();
        let id = rt
            .enqueue("enrichment", "lookup", json!(1), EnqueueOptions::default())
            .await
            .unwrap();

        let cancelled = rt.cancel(id).await.unwrap();
        assert_eq!(cancelled.id, id);
        assert!(rt.get_job(id).await.is_err());

        assert!(matches!(events.recv().await.unwrap(), DomainEvent::Enqueued { .. }));
        assert_eq!(events.recv().await.unwrap(), DomainEvent::Cancelled { id });
        assert!(matches!(rt.wait_for(id).await, Err(RampartError::TaskNotFound(_))));
    }
}
