//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use super::runtime::{Runtime, TaskDefaults};
use super::sweeper_loop::{SweeperHandle, SweeperLoop};
use super::worker_loop::WorkerGroup;
use crate::config::Settings;
use crate::domain::HandlerKey;
use crate::error::RampartError;
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, SystemClock, TaskStore, UlidGenerator};
use crate::resilience::Resilience;
use crate::typed::{Handler, HandlerRegistry, Task};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .with_settings(settings)
///     .register::<LookupContact, _>(LookupHandler)?
///     .register_fn("outreach", "send", |payload| async move { send(payload).await })?
///     .expect_tasks(&[("enrichment", "lookup_contact"), ("outreach", "send")])
///     .build()?;
/// let handle = app.start();
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される (queue, name) を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    settings: Settings,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn TaskStore>>,
    resilience: Option<Resilience>,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<HandlerKey>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers: {0:?}. These tasks were expected but not registered.")]
    MissingHandlers(Vec<HandlerKey>),

    #[error(transparent)]
    InvalidSettings(#[from] RampartError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            clock: None,
            store: None,
            resilience: None,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// デフォルトは SystemClock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// デフォルトは InMemoryTaskStore
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// handler と共有する Resilience を渡す。省略時は settings から組み立てる。
    pub fn with_resilience(mut self, resilience: Resilience) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RampartError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// クロージャ handler を登録
    pub fn register_fn<F, Fut>(
        mut self,
        queue: impl Into<String>,
        name: impl Into<String>,
        f: F,
    ) -> Result<Self, RampartError>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RampartError>> + Send + 'static,
    {
        self.registry.register_fn(queue, name, f)?;
        Ok(self)
    }

    /// 期待される (queue, name) のリストを設定
    pub fn expect_tasks(mut self, tasks: &[(&str, &str)]) -> Self {
        let expected = tasks
            .iter()
            .map(|&(queue, name)| HandlerKey::new(queue, name))
            .collect();
        self.expected_tasks = Some(expected);
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - settings.validate()
    /// - expect_tasks() で設定された handler が全て登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        self.settings.validate()?;

        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<HandlerKey> = expected
                .iter()
                .filter(|key| !self.registry.contains(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryTaskStore::new(Arc::clone(&clock))),
        };
        let resilience = self
            .resilience
            .unwrap_or_else(|| Resilience::from_settings(&self.settings, Arc::clone(&clock)));

        let defaults = TaskDefaults {
            max_attempts: self.settings.tasks.max_attempts,
            backoff: self.settings.tasks.backoff,
        };
        let runtime = Runtime::new(
            store,
            Arc::new(self.registry),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            defaults,
        );

        Ok(App {
            runtime: Arc::new(runtime),
            resilience,
            settings: self.settings,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wired application. `start()` spawns the worker pools and the sweeper.
pub struct App {
    runtime: Arc<Runtime>,
    resilience: Resilience,
    settings: Settings,
}

impl App {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// One worker group per queue that has handlers, sized by `queues.<name>.concurrency`.
    pub fn start(&self) -> AppHandle {
        let groups: Vec<WorkerGroup> = self
            .runtime
            .registry()
            .queues()
            .into_iter()
            .map(|queue| {
                let n = self.settings.concurrency_for(&queue);
                WorkerGroup::spawn(queue, n, Arc::clone(&self.runtime))
            })
            .collect();

        let sweeper = SweeperLoop::new(
            self.resilience.clone(),
            self.settings.maintenance.sweep_interval(),
        )
        .spawn();

        info!(queues = groups.len(), "app started");
        AppHandle { groups, sweeper }
    }
}

pub struct AppHandle {
    groups: Vec<WorkerGroup>,
    sweeper: SweeperHandle,
}

impl AppHandle {
    pub fn worker_groups(&self) -> &[WorkerGroup] {
        &self.groups
    }

    /// Stop claiming, let in-flight tasks finish, stop the sweeper.
    pub async fn shutdown(self) {
        for group in &self.groups {
            group.request_shutdown();
        }
        for group in self.groups {
            group.shutdown_and_join().await;
        }
        self.sweeper.shutdown_and_join().await;
        info!("app stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::domain::{EnqueueOptions, TaskState};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct LookupContact {
        email: String,
    }

    impl Task for LookupContact {
        const QUEUE: &'static str = "enrichment";
        const NAME: &'static str = "lookup_contact";
    }

    #[derive(Debug, Serialize)]
    struct Contact {
        email: String,
        company: String,
    }

    struct LookupHandler {
        resilience: Resilience,
    }

    #[async_trait]
    impl Handler<LookupContact> for LookupHandler {
        type Output = Contact;

        async fn handle(&self, task: LookupContact) -> Result<Contact, RampartError> {
            let company: String = self
                .resilience
                .cache
                .get_or_compute(
                    &format!("company:{}", task.email),
                    std::time::Duration::from_secs(60),
                    || async { Ok::<_, String>("Acme".to_string()) },
                )
                .await?;
            Ok(Contact {
                email: task.email,
                company,
            })
        }
    }

    #[test]
    fn build_success() {
        let app = AppBuilder::new()
            .register_fn("outreach", "send", |p| async move { Ok::<_, RampartError>(p) })
            .unwrap()
            .expect_tasks(&[("outreach", "send")])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_missing_handlers() {
        let app = AppBuilder::new()
            .register_fn("outreach", "send", |p| async move { Ok::<_, RampartError>(p) })
            .unwrap()
            .expect_tasks(&[("outreach", "send"), ("enrichment", "lookup_contact")])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingHandlers(missing))
                if missing == vec![HandlerKey::new("enrichment", "lookup_contact")]
        ));
    }

    #[test]
    fn build_rejects_invalid_settings() {
        let mut settings = Settings::default();
        settings.tasks.default_concurrency = 0;
        let app = AppBuilder::new().with_settings(settings).build();
        assert!(matches!(app, Err(BuildError::InvalidSettings(RampartError::Config(_)))));
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let result = AppBuilder::new()
            .register_fn("outreach", "send", |p| async move { Ok::<_, RampartError>(p) })
            .unwrap()
            .register_fn("outreach", "send", |p| async move { Ok::<_, RampartError>(p) });
        assert!(matches!(result, Err(RampartError::DuplicateHandler(_))));
    }

    #[tokio::test]
    async fn start_runs_typed_tasks_and_shuts_down() {
        let mut settings = Settings::default();
        settings
            .queues
            .insert("enrichment".into(), QueueSettings { concurrency: 2 });
        let resilience = Resilience::from_settings(&settings, Arc::new(SystemClock));

        let app = AppBuilder::new()
            .with_settings(settings)
            .with_resilience(resilience.clone())
            .register::<LookupContact, _>(LookupHandler {
                resilience: resilience.clone(),
            })
            .unwrap()
            .expect_tasks(&[("enrichment", "lookup_contact")])
            .build()
            .unwrap();
        let handle = app.start();
        assert_eq!(handle.worker_groups().len(), 1);
        assert_eq!(handle.worker_groups()[0].queue(), "enrichment");
        assert_eq!(handle.worker_groups()[0].size(), 2);

        let runtime = app.runtime();
        let first = runtime
            .enqueue_task(&LookupContact { email: "a@acme.io".into() }, EnqueueOptions::default())
            .await
            .unwrap();
        let result = runtime.wait_for(first).await.unwrap();
        assert_eq!(result, json!({"email": "a@acme.io", "company": "Acme"}));

        let second = runtime
            .enqueue_task(&LookupContact { email: "a@acme.io".into() }, EnqueueOptions::default())
            .await
            .unwrap();
        runtime.wait_for(second).await.unwrap();

        // 2 回目は同じキーなのでキャッシュヒット
        assert_eq!(app.resilience().cache.stats().total_hits, 1);

        let status = runtime.status().await;
        assert_eq!(status.totals.completed, 2);
        assert_eq!(runtime.get_job(first).await.unwrap().state, TaskState::Completed);

        handle.shutdown().await;
    }
}
