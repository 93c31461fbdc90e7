//! Resilience - キャッシュ・レート制限・サーキットブレーカー
//!
//! いずれもプロセス内の共有状態。グローバル変数にはせず、`Resilience` を
//! 明示的に組み立てて handler やホストアプリに渡す（テストでは個別インスタンス）。
//!
//! キー単位の read-modify-write はすべて DashMap のエントリロック内で完結し、
//! await をまたいでロックを保持しない。

pub mod breaker;
pub mod cache;
pub mod rate_limit;

use std::sync::Arc;

pub use self::breaker::{BreakerConfig, BreakerError, BreakerState, BreakerStatus, CircuitBreakers};
pub use self::cache::{CacheEntry, CacheStats, KeyHits, TtlCache};
pub use self::rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter};

use crate::config::Settings;
use crate::ports::Clock;

/// The three shared stores, wired together.
#[derive(Clone)]
pub struct Resilience {
    pub cache: Arc<TtlCache>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakers>,
}

impl Resilience {
    pub fn new(cache: TtlCache, limiter: RateLimiter, breakers: CircuitBreakers) -> Self {
        Self {
            cache: Arc::new(cache),
            limiter: Arc::new(limiter),
            breakers: Arc::new(breakers),
        }
    }

    /// Build from settings. When `breaker.rate_limit` is set, breakers consult
    /// the same limiter before each admitted call.
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        let cache = TtlCache::new(Arc::clone(&clock), settings.cache.default_ttl())
            .with_top_keys(settings.cache.top_keys);
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&clock)));

        let mut breakers = CircuitBreakers::new(settings.breaker.to_config(), clock);
        if let Some(rate_limit) = &settings.breaker.rate_limit {
            breakers = breakers.with_rate_limit(Arc::clone(&limiter), rate_limit.to_rule());
        }

        Self {
            cache: Arc::new(cache),
            limiter,
            breakers: Arc::new(breakers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::ports::SystemClock;

    #[tokio::test]
    async fn breaker_shares_limiter_when_configured() {
        let mut settings = Settings::default();
        settings.breaker.rate_limit = Some(RateLimitSettings {
            limit: 1,
            window_secs: 60,
        });
        let resilience = Resilience::from_settings(&settings, Arc::new(SystemClock));

        resilience
            .breakers
            .call("user-1:crm", || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        let err = resilience
            .breakers
            .call("user-1:crm", || async { Ok::<_, String>(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, BreakerError::RateLimited(_)));
        assert_eq!(resilience.limiter.tracked_keys(), 1);
    }

    #[test]
    fn clones_share_state() {
        let resilience = Resilience::from_settings(&Settings::default(), Arc::new(SystemClock));
        let other = resilience.clone();
        other
            .cache
            .insert("k", serde_json::json!(1), std::time::Duration::from_secs(60));
        assert_eq!(resilience.cache.len(), 1);
    }
}
