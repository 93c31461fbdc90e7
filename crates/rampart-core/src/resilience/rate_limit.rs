//! Fixed window rate limiter.
//!
//! Each key gets a counter and a `reset_at`. O(1) memory and cost per key;
//! the tradeoff is that a caller can spend `limit` calls at the end of one
//! window and `limit` more at the start of the next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::RateLimitExceeded;
use crate::ports::Clock;
use crate::ports::clock::add_duration;

/// Result of one `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Limit + window pair, for callers that apply the same rule repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window: Duration,
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u64,
    reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    windows: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Count one call against `key`.
    ///
    /// The read-check-increment happens under the key's shard lock, so
    /// concurrent callers never both take the last slot.
    pub fn check(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        let now = self.clock.now();
        if limit == 0 {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: add_duration(now, window),
            };
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                reset_at: add_duration(now, window),
            });

        // Window elapsed: start a fresh one
        if now > entry.reset_at {
            entry.count = 0;
            entry.reset_at = add_duration(now, window);
        }

        if entry.count < limit {
            entry.count += 1;
            let remaining = limit - entry.count;
            trace!(key, remaining, "rate limit: allowed");
            RateLimitDecision {
                allowed: true,
                remaining,
                reset_at: entry.reset_at,
            }
        } else {
            trace!(key, "rate limit: denied");
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.reset_at,
            }
        }
    }

    /// `check`, turning a denial into `RateLimitExceeded`.
    pub fn enforce(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitExceeded> {
        let decision = self.check(key, limit, window);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitExceeded {
                key: key.to_string(),
                limit,
                reset_at: decision.reset_at,
            })
        }
    }

    pub fn enforce_rule(
        &self,
        key: &str,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision, RateLimitExceeded> {
        self.enforce(key, rule.limit, rule.window)
    }

    /// Forget the window for `key`.
    pub fn reset(&self, key: &str) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drop entries whose window has expired; memory stays bounded by the
    /// number of recently active keys.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, entry| now <= entry.reset_at);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
