//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. TaskStore::claim() で次のタスクを取得（無ければ待機、busy-poll しない）
//! 2. (queue, name) で DynHandler を引く
//! 3. handler を別タスクで実行（panic を JoinError として捕捉）
//! 4. lease.complete() / lease.fail() で結果を反映（リトライ判断はストア側）
//!
//! 1 キューにつき N 本の worker を起動し、各 worker は同時に 1 タスクしか持たない。
//! よってキューごとの同時実行数は常に N 以下。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::runtime::Runtime;
use crate::domain::DomainEvent;
use crate::error::RampartError;
use crate::ports::{FailOutcome, TaskLease};

/// Worker group handle for one queue.
/// - `request_shutdown()` で新しい claim を止める
/// - `shutdown_and_join()` で実行中のタスクが終わるまで待つ（途中で打ち切らない）
pub struct WorkerGroup {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers for `queue` (at least one).
    pub fn spawn(queue: impl Into<String>, n: usize, runtime: Arc<Runtime>) -> Self {
        let queue = queue.into();
        let n = n.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let rt = Arc::clone(&runtime);
            let q = queue.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, &q, rt, &mut rx).await;
            });
            joins.push(join);
        }

        info!(queue = %queue, workers = n, "worker group started");
        Self {
            queue,
            shutdown_tx,
            joins,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    /// Stop taking new tasks. In-flight handlers run to completion.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(queue = %self.queue, error = %e, "worker terminated abnormally");
            }
        }
        info!(queue = %self.queue, "worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: &str,
    runtime: Arc<Runtime>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // claim は「待つ」ので select で shutdown と競合させる
        // claim の future は lock 内で完結するので、途中で drop しても状態は壊れない
        let claimed = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // sender が drop された = group ごと破棄された
                    break;
                }
                continue;
            }
            claimed = runtime.store().claim(queue) => claimed,
        };

        match claimed {
            Ok(lease) => execute(worker_id, &runtime, lease).await,
            Err(e) => {
                warn!(worker_id, queue, error = %e, "claim failed");
                tokio::task::yield_now().await;
            }
        }
    }
    debug!(worker_id, queue, "worker exited");
}

/// Run one attempt and record its outcome. Never propagates handler errors.
async fn execute(worker_id: usize, runtime: &Runtime, lease: Box<dyn TaskLease>) {
    let record = lease.record().clone();
    let span = info_span!(
        "task",
        task_id = %record.id,
        queue = %record.queue,
        task = %record.name,
        attempt = record.attempts,
        worker_id,
    );

    async {
        runtime.publish(DomainEvent::Started {
            id: record.id,
            attempt: record.attempts,
        });

        let result = match runtime.registry().get(&record.handler_key()) {
            Some(handler) => {
                let payload = record.payload.clone();
                // 別タスクで走らせ、panic を worker に波及させない
                let join = tokio::spawn(
                    async move { handler.handle_dyn(payload).await }.in_current_span(),
                );
                match join.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(RampartError::compute("handler panicked")),
                    Err(_) => Err(RampartError::compute("handler cancelled")),
                }
            }
            None => Err(RampartError::HandlerNotFound(record.handler_key())),
        };

        match result {
            Ok(value) => match lease.complete(value).await {
                Ok(done) => {
                    info!(attempts = done.attempts, "completed");
                    runtime.publish(DomainEvent::Completed {
                        id: done.id,
                        attempts: done.attempts,
                    });
                }
                Err(e) => warn!(error = %e, "complete rejected"),
            },
            Err(err) => {
                let message = failure_message(&err);
                match lease.fail(message.clone()).await {
                    Ok(FailOutcome::RetryScheduled(r)) => {
                        warn!(error = %message, run_after = ?r.run_after, "attempt failed; retry scheduled");
                        runtime.publish(DomainEvent::RetryScheduled {
                            id: r.id,
                            attempts: r.attempts,
                            run_after: r.run_after.unwrap_or(r.created_at),
                            error: message,
                        });
                    }
                    Ok(FailOutcome::Exhausted(r)) => {
                        error!(error = %message, attempts = r.attempts, "task failed; retries exhausted");
                        runtime.publish(DomainEvent::Failed {
                            id: r.id,
                            attempts: r.attempts,
                            error: message,
                        });
                    }
                    Err(e) => warn!(error = %e, "fail rejected"),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// `lastError` text: the handler's own message, without the `compute failed:` prefix.
fn failure_message(err: &RampartError) -> String {
    match err {
        RampartError::Compute(message) => message.clone(),
        other => other.to_string(),
    }
}
