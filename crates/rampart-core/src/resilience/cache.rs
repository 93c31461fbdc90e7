//! TTL read-through cache.
//!
//! Entries expire by time only (no size-based eviction). Expired entries are
//! treated as misses on read and removed by `sweep_expired`, which the sweeper
//! loop calls periodically.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::RampartError;
use crate::ports::Clock;
use crate::ports::clock::add_duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHits {
    pub key: String,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
    /// Most-hit keys, descending.
    pub top_keys: Vec<KeyHits>,
}

pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    top_keys: usize,
}

impl TtlCache {
    pub fn new(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            default_ttl,
            top_keys: 10,
        }
    }

    /// How many keys `stats()` reports in `top_keys`.
    pub fn with_top_keys(mut self, n: usize) -> Self {
        self.top_keys = n;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the live value for `key`, or compute, store and return it.
    ///
    /// A hit bumps `hit_count` and never calls `supplier`. On a miss the
    /// supplier runs; if it fails nothing is written and any expired entry is
    /// left as-is (it is not served as a stale fallback).
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        supplier: F,
    ) -> Result<T, RampartError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Some(value) = self.lookup::<T>(key) {
            trace!(key, "cache hit");
            return Ok(value);
        }

        trace!(key, "cache miss");
        let value = supplier().await.map_err(RampartError::compute)?;

        // 保存に失敗しても計算結果はそのまま返す
        match serde_json::to_value(&value) {
            Ok(json) => self.insert(key, json, ttl),
            Err(e) => warn!(key, error = %e, "cache value not serializable; skipping store"),
        }
        Ok(value)
    }

    /// Live value as JSON; counts as a hit.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lookup::<serde_json::Value>(key)
    }

    /// Store a value, resetting its hit count.
    pub fn insert(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                expires_at: add_duration(now, ttl),
                hit_count: 0,
                last_accessed_at: now,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key matches `pattern`.
    ///
    /// A trailing `*` makes it a prefix match (`"user:42:*"`); anything else is
    /// a substring match. Returns the number of removed entries.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        match pattern.strip_suffix('*') {
            Some(prefix) => self.entries.retain(|key, _| !key.starts_with(prefix)),
            None => self.entries.retain(|key, _| !key.contains(pattern)),
        }
        let removed = before.saturating_sub(self.entries.len());
        debug!(pattern, removed, "cache invalidated");
        removed
    }

    /// Drop entries with `expires_at < now`.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries (expired ones included until swept), sorted by key.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn stats(&self) -> CacheStats {
        let mut hits: Vec<KeyHits> = self
            .entries
            .iter()
            .map(|e| KeyHits {
                key: e.key().clone(),
                hit_count: e.hit_count,
            })
            .collect();
        let total_hits = hits.iter().map(|h| h.hit_count).sum();
        hits.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(self.top_keys);

        CacheStats {
            total_entries: self.entries.len(),
            total_hits,
            top_keys: hits,
        }
    }

    /// Live, decodable value for `key`. The shard lock is held only for the
    /// duration of this call.
    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_live(now) {
            return None;
        }
        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => {
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "cached value does not match requested type; recomputing");
                None
            }
        }
    }
}
