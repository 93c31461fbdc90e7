//! Per-key circuit breakers.
//!
//! # States
//! - Closed: calls pass through, failures are counted
//! - Open: calls fail fast with `CircuitOpenError`, the operation never runs
//! - HalfOpen: exactly one probe call is in flight; everyone else is rejected
//!
//! # Transitions
//! ```text
//! Closed   -> Open:     failure_count >= threshold within the last failure_window
//! Open     -> HalfOpen: first call after opened_at + cooldown (it becomes the probe)
//! HalfOpen -> Closed:   probe succeeds (counters reset)
//! HalfOpen -> Open:     probe fails (opened_at = now, cooldown restarts)
//! ```
//!
//! Keys are per caller + dependency (e.g. `"user-42:calendar"`), so one user's
//! broken integration does not trip the breaker for others.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::rate_limit::{RateLimitRule, RateLimiter};
use crate::error::{CircuitOpenError, RampartError, RateLimitExceeded};
use crate::ports::Clock;
use crate::ports::clock::{add_duration, remaining};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without running the operation.
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The configured limiter denied the call; the operation did not run.
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// The operation ran and failed; its error is passed through unchanged.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BreakerError::Operation(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> From<BreakerError<E>> for RampartError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open(e) => RampartError::CircuitOpen(e),
            BreakerError::RateLimited(e) => RampartError::RateLimited(e),
            BreakerError::Operation(e) => RampartError::compute(e),
        }
    }
}

/// Read-only view for diagnostics and boundary mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Set while Open: time until the next call may probe.
    pub cooldown_remaining: Option<Duration>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    /// Failure times inside the rolling window, oldest first (at most `failure_threshold`).
    recent_failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Registry of breakers keyed by caller + dependency.
pub struct CircuitBreakers {
    entries: DashMap<String, BreakerEntry>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    rate_limit: Option<(Arc<RateLimiter>, RateLimitRule)>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            cooldown_secs = config.cooldown.as_secs(),
            "circuit breakers initialized"
        );
        Self {
            entries: DashMap::new(),
            config,
            clock,
            rate_limit: None,
        }
    }

    /// Consult `limiter` (per breaker key) before each admitted call.
    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>, rule: RateLimitRule) -> Self {
        self.rate_limit = Some((limiter, rule));
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` under the breaker for `key`.
    ///
    /// Allowed calls are transparent: the operation's value or error comes back
    /// unchanged (errors wrapped in `BreakerError::Operation`).
    pub async fn call<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit(key)?;

        if let Some((limiter, rule)) = &self.rate_limit {
            // permit の drop で probe 枠は解放される
            limiter.enforce_rule(key, *rule)?;
        }

        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }
        result.map_err(BreakerError::Operation)
    }

    /// Current state for `key`. Pure read: an elapsed cooldown is reported as
    /// Open with zero remaining until a call actually probes.
    pub fn get_status(&self, key: &str) -> BreakerStatus {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) => self.status_of(key, &entry, now),
            None => self.status_of(key, &BreakerEntry::default(), now),
        }
    }

    /// Status of every key seen so far, sorted by key.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let now = self.clock.now();
        let mut all: Vec<BreakerStatus> = self
            .entries
            .iter()
            .map(|e| self.status_of(e.key(), e.value(), now))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Force `key` back to a fresh closed breaker.
    pub fn reset(&self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            info!(key, "circuit breaker reset");
        }
        existed
    }

    fn status_of(&self, key: &str, entry: &BreakerEntry, now: DateTime<Utc>) -> BreakerStatus {
        let cooldown_remaining = match (entry.state, entry.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                Some(remaining(now, add_duration(opened_at, self.config.cooldown)))
            }
            _ => None,
        };
        BreakerStatus {
            key: key.to_string(),
            state: entry.state,
            failure_count: entry.failure_count,
            failure_threshold: self.config.failure_threshold,
            opened_at: entry.opened_at,
            cooldown_remaining,
            last_failure_at: entry.last_failure_at,
            last_success_at: entry.last_success_at,
        }
    }

    fn rejection(&self, key: &str, entry: &BreakerEntry, now: DateTime<Utc>) -> CircuitOpenError {
        let cooldown_remaining = match (entry.state, entry.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                remaining(now, add_duration(opened_at, self.config.cooldown))
            }
            _ => Duration::ZERO,
        };
        CircuitOpenError {
            key: key.to_string(),
            state: entry.state,
            opened_at: entry.opened_at,
            cooldown_remaining,
        }
    }

    /// Decide admission and claim the probe slot atomically under the key's lock.
    fn admit(&self, key: &str) -> Result<Permit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_default();

        let probe = match entry.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let reopen_at = entry
                    .opened_at
                    .map(|at| add_duration(at, self.config.cooldown))
                    .unwrap_or(now);
                if now < reopen_at {
                    return Err(self.rejection(key, &entry, now));
                }
                entry.state = BreakerState::HalfOpen;
                entry.probe_in_flight = true;
                info!(key, "circuit half-open; admitting probe");
                true
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    return Err(self.rejection(key, &entry, now));
                }
                entry.probe_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breakers: self,
            key: key.to_string(),
            probe,
            settled: false,
        })
    }

    fn record_success(&self, key: &str, probe: bool) {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.last_success_at = Some(now);

        if probe {
            entry.state = BreakerState::Closed;
            entry.failure_count = 0;
            entry.recent_failures.clear();
            entry.opened_at = None;
            entry.probe_in_flight = false;
            info!(key, "circuit closed (recovered)");
        } else if entry.state == BreakerState::Closed {
            entry.failure_count = 0;
            entry.recent_failures.clear();
        }
    }

    fn record_failure(&self, key: &str, probe: bool) {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.last_failure_at = Some(now);

        if probe {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(now);
            entry.probe_in_flight = false;
            warn!(key, "probe failed; circuit re-opened");
            return;
        }

        if entry.state != BreakerState::Closed {
            // 他の呼び出しで既に open になっている
            return;
        }

        let window_start = chrono::Duration::from_std(self.config.failure_window)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        while entry
            .recent_failures
            .front()
            .is_some_and(|&at| at < window_start)
        {
            entry.recent_failures.pop_front();
        }
        entry.recent_failures.push_back(now);
        let cap = self.config.failure_threshold.max(1) as usize;
        while entry.recent_failures.len() > cap {
            entry.recent_failures.pop_front();
        }
        entry.failure_count = entry.recent_failures.len() as u32;
        debug!(key, failure_count = entry.failure_count, "failure recorded");

        if entry.failure_count >= self.config.failure_threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(now);
            warn!(
                key,
                failure_count = entry.failure_count,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    fn release_probe(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.state == BreakerState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }
}

/// Admission ticket for one call.
///
/// A probe permit dropped without an outcome (limiter denial, cancelled
/// future) frees the probe slot so the key does not stay wedged in HalfOpen.
struct Permit<'a> {
    breakers: &'a CircuitBreakers,
    key: String,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.key, self.probe);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breakers.record_failure(&self.key, self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breakers.release_probe(&self.key);
        }
    }
}
