//! Settings - 設定ファイル + 環境変数
//!
//! 読み込み順（後勝ち）:
//! 1. 各フィールドのデフォルト値
//! 2. TOML ファイル（指定された場合のみ）
//! 3. 環境変数 `RAMPART__<SECTION>__<KEY>`（例: `RAMPART__BREAKER__FAILURE_THRESHOLD=5`）

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::RampartError;
use crate::resilience::{BreakerConfig, RateLimitRule};

const ENV_PREFIX: &str = "RAMPART";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub tasks: TaskSettings,
    /// Per-queue overrides, keyed by queue name.
    pub queues: HashMap<String, QueueSettings>,
    pub breaker: BreakerSettings,
    pub cache: CacheSettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// EnvFilter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Worker count for queues without an entry under `queues`.
    pub default_concurrency: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            default_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub failure_window_secs: u64,
    pub rate_limit: Option<RateLimitSettings>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            failure_window_secs: 60,
            rate_limit: None,
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub limit: u64,
    pub window_secs: u64,
}

impl RateLimitSettings {
    pub fn to_rule(&self) -> RateLimitRule {
        RateLimitRule {
            limit: self.limit,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub top_keys: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            top_keys: 10,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

impl MaintenanceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Settings {
    /// Load defaults, then `path` (if any), then `RAMPART__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, RampartError> {
        Self::load_from(path, None)
    }

    /// Like [`Settings::load`] but reads overrides from `vars` instead of the
    /// process environment.
    pub fn load_with_vars(
        path: Option<&Path>,
        vars: ::config::Map<String, String>,
    ) -> Result<Self, RampartError> {
        Self::load_from(path, Some(vars))
    }

    fn load_from(
        path: Option<&Path>,
        vars: Option<::config::Map<String, String>>,
    ) -> Result<Self, RampartError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Worker pool size for `queue`.
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|q| q.concurrency)
            .unwrap_or(self.tasks.default_concurrency)
    }

    pub fn validate(&self) -> Result<(), RampartError> {
        if self.tasks.default_concurrency == 0 {
            return Err(RampartError::Config(
                "tasks.default_concurrency must be at least 1".into(),
            ));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, q)| q.concurrency == 0) {
            return Err(RampartError::Config(format!(
                "queues.{name}.concurrency must be at least 1"
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(RampartError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if let Some(rl) = &self.breaker.rate_limit {
            if rl.window_secs == 0 {
                return Err(RampartError::Config(
                    "breaker.rate_limit.window_secs must be at least 1".into(),
                ));
            }
        }
        if self.maintenance.sweep_interval_secs == 0 {
            return Err(RampartError::Config(
                "maintenance.sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.tasks.max_attempts, 3);
        assert_eq!(settings.breaker.to_config(), BreakerConfig::default());
        assert_eq!(settings.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(settings.concurrency_for("anything"), 4);
    }

    #[test]
    fn loads_toml_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("rampart-config-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rampart.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[tasks]
max_attempts = 5
backoff = {{ kind = "fixed", delay_ms = 1000 }}

[queues.enrichment]
concurrency = 8

[breaker]
failure_threshold = 3

[breaker.rate_limit]
limit = 100
window_secs = 60
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.tasks.max_attempts, 5);
        assert_eq!(settings.tasks.backoff, BackoffPolicy::fixed(Duration::from_secs(1)));
        assert_eq!(settings.concurrency_for("enrichment"), 8);
        assert_eq!(settings.concurrency_for("outreach"), 4);
        assert_eq!(settings.breaker.failure_threshold, 3);
        assert_eq!(settings.breaker.cooldown_secs, 30);
        assert_eq!(
            settings.breaker.rate_limit.map(|r| r.to_rule().limit),
            Some(100)
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn env_vars_override_defaults() {
        let vars = [
            ("RAMPART__BREAKER__FAILURE_THRESHOLD", "7"),
            ("RAMPART__QUEUES__ENRICHMENT__CONCURRENCY", "9"),
            ("RAMPART__LOG__JSON", "true"),
            ("UNRELATED__BREAKER__COOLDOWN_SECS", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = Settings::load_with_vars(None, vars).unwrap();
        assert_eq!(settings.breaker.failure_threshold, 7);
        assert_eq!(settings.breaker.cooldown_secs, 30);
        assert_eq!(settings.concurrency_for("enrichment"), 9);
        assert!(settings.log.json);
    }

    #[test]
    fn env_vars_are_validated() {
        let vars = [("RAMPART__TASKS__DEFAULT_CONCURRENCY".to_string(), "0".to_string())]
            .into_iter()
            .collect();
        let err = Settings::load_with_vars(None, vars).unwrap_err();
        assert!(matches!(err, RampartError::Config(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/rampart.toml"))).unwrap_err();
        assert!(matches!(err, RampartError::Config(_)));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings
            .queues
            .insert("enrichment".into(), QueueSettings { concurrency: 0 });
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("queues.enrichment.concurrency"));
    }

    #[test]
    fn rejects_zero_threshold() {
        let mut settings = Settings::default();
        settings.breaker.failure_threshold = 0;
        assert!(matches!(settings.validate(), Err(RampartError::Config(_))));
    }
}
