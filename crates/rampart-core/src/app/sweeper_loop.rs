//! SweeperLoop - 期限切れエントリの定期回収
//!
//! # フロー
//! 1. `interval` ごとに起床
//! 2. TtlCache::sweep_expired() で expires_at < now のエントリを削除
//! 3. RateLimiter::cleanup() で窓が終わったキーを削除
//!
//! lookup 側も期限切れを miss として扱うので、回収が遅れても正しさには影響しない。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::resilience::Resilience;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub cache_entries_removed: usize,
    pub rate_limit_keys_removed: usize,
}

pub struct SweeperLoop {
    resilience: Resilience,
    interval: Duration,
}

impl SweeperLoop {
    pub fn new(resilience: Resilience, interval: Duration) -> Self {
        Self {
            resilience,
            interval,
        }
    }

    pub fn run_once(&self) -> SweepReport {
        let report = SweepReport {
            cache_entries_removed: self.resilience.cache.sweep_expired(),
            rate_limit_keys_removed: self.resilience.limiter.cleanup(),
        };
        if report != SweepReport::default() {
            debug!(
                cache_entries_removed = report.cache_entries_removed,
                rate_limit_keys_removed = report.rate_limit_keys_removed,
                "sweep"
            );
        }
        report
    }

    /// Run until `shutdown_rx` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 最初の tick は即時に返るので読み捨てる
        ticker.tick().await;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_once();
                }
            }
        }
        info!("sweeper stopped");
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle { shutdown_tx, join }
    }
}

pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::ports::{Clock, FixedClock};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (Arc<FixedClock>, Resilience) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let resilience =
            Resilience::from_settings(&Settings::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, resilience)
    }

    #[test]
    fn run_once_sweeps_cache_and_limiter() {
        let (clock, resilience) = setup();
        resilience
            .cache
            .insert("short", serde_json::json!(1), Duration::from_secs(1));
        resilience
            .cache
            .insert("long", serde_json::json!(2), Duration::from_secs(600));
        resilience.limiter.check("k", 10, Duration::from_secs(1));

        clock.advance(Duration::from_secs(5));
        let report = SweeperLoop::new(resilience.clone(), Duration::from_secs(60)).run_once();

        assert_eq!(
            report,
            SweepReport {
                cache_entries_removed: 1,
                rate_limit_keys_removed: 1,
            }
        );
        assert_eq!(resilience.cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_until_shutdown() {
        let (clock, resilience) = setup();
        resilience
            .cache
            .insert("k", serde_json::json!(1), Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let handle = SweeperLoop::new(resilience.clone(), Duration::from_secs(60)).spawn();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(resilience.cache.len(), 1, "first tick is skipped");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(resilience.cache.is_empty());

        handle.shutdown_and_join().await;
    }
}
