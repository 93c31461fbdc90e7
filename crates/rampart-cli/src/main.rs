use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use rampart_core::domain::{BackoffPolicy, EnqueueOptions};
use rampart_core::observability::init_tracing;
use rampart_core::ports::SystemClock;
use rampart_core::{AppBuilder, Handler, RampartError, Resilience, Settings, Task};

/// Demo host: enrichment jobs behind a breaker + cache, digests behind a rate limit.
#[derive(Debug, Parser)]
#[command(name = "rampart", version)]
struct Args {
    /// TOML settings file (RAMPART__* env vars override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of enrichment tasks to enqueue
    #[arg(long, default_value_t = 8)]
    tasks: usize,

    /// Simulated upstream fails every N-th call (0 = never)
    #[arg(long, default_value_t = 3)]
    fail_every: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// 外部 API の代わり。`fail_every` 回に 1 回失敗する。
struct FlakyUpstream {
    calls: AtomicU64,
    fail_every: u64,
}

impl FlakyUpstream {
    async fn lookup(&self, email: &str) -> Result<Company, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(format!("upstream 503 (call #{n})"));
        }
        let domain = email.split('@').nth(1).unwrap_or("unknown");
        Ok(Company {
            domain: domain.to_string(),
            employees: 10 + (n % 7) * 25,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Company {
    domain: String,
    employees: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnrichContact {
    user_id: String,
    email: String,
}

impl Task for EnrichContact {
    const QUEUE: &'static str = "enrichment";
    const NAME: &'static str = "enrich_contact";
}

struct EnrichHandler {
    resilience: Resilience,
    upstream: Arc<FlakyUpstream>,
}

#[async_trait]
impl Handler<EnrichContact> for EnrichHandler {
    type Output = Company;

    async fn handle(&self, task: EnrichContact) -> Result<Company, RampartError> {
        let breaker_key = format!("{}:crm", task.user_id);
        let cache_key = format!("company:{}", task.email);
        let ttl = self.resilience.cache.default_ttl();

        let breakers = &self.resilience.breakers;
        let upstream = &self.upstream;
        self.resilience
            .cache
            .get_or_compute(&cache_key, ttl, || async move {
                breakers
                    .call(&breaker_key, || upstream.lookup(&task.email))
                    .await
            })
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    if args.json_logs {
        settings.log.json = true;
    }
    init_tracing(&settings.log);

    let resilience = Resilience::from_settings(&settings, Arc::new(SystemClock));
    let upstream = Arc::new(FlakyUpstream {
        calls: AtomicU64::new(0),
        fail_every: args.fail_every,
    });

    let limiter = Arc::clone(&resilience.limiter);
    let app = AppBuilder::new()
        .with_settings(settings)
        .with_resilience(resilience.clone())
        .register::<EnrichContact, _>(EnrichHandler {
            resilience: resilience.clone(),
            upstream,
        })?
        .register_fn("outreach", "send_digest", move |payload| {
            let limiter = Arc::clone(&limiter);
            async move {
                let user = payload["user_id"].as_str().unwrap_or("anonymous").to_string();
                limiter.enforce(&format!("{user}:mail"), 2, Duration::from_secs(60))?;
                Ok(serde_json::json!({ "sent_to": user }))
            }
        })?
        .expect_tasks(&[
            (EnrichContact::QUEUE, EnrichContact::NAME),
            ("outreach", "send_digest"),
        ])
        .build()?;

    let handle = app.start();
    let runtime = Arc::clone(app.runtime());

    let options = EnqueueOptions::default()
        .max_attempts(3)
        .backoff(BackoffPolicy::fixed(Duration::from_millis(200)));

    let mut ids = Vec::new();
    for i in 0..args.tasks {
        let task = EnrichContact {
            user_id: format!("user-{}", i % 3),
            email: format!("contact{}@example{}.com", i % 5, i % 2),
        };
        ids.push(runtime.enqueue_task(&task, options.clone()).await?);
    }
    for i in 0..3 {
        let payload = serde_json::json!({ "user_id": "user-0", "digest": i });
        ids.push(
            runtime
                .enqueue("outreach", "send_digest", payload, EnqueueOptions::default().max_attempts(1))
                .await?,
        );
    }
    info!(count = ids.len(), "enqueued");

    let mut tasks = Vec::with_capacity(ids.len());
    for id in &ids {
        // 失敗もスナップショットとして出力するので結果は見ない
        let _ = runtime.wait_for(*id).await;
        tasks.push(runtime.get_job(*id).await?);
    }

    let report = serde_json::json!({
        "tasks": tasks,
        "status": runtime.status().await,
        "breakers": app.resilience().breakers.statuses(),
        "cache": app.resilience().cache.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    handle.shutdown().await;
    Ok(())
}
