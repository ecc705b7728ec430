//! Cache Store
//!
//! In-process key/value store with per-entry TTL. Keys are
//! `topic:rest` strings so the change bridge can invalidate coarsely
//! by topic prefix.
//!
//! Expiry is lazy: a `get` that finds an expired entry deletes it and
//! reports a miss. The periodic reconciler runs an additional sweep to
//! bound memory for keys that are set and never read again.
//!
//! Monotonic time comes from `tokio::time::Instant` so expiry behavior
//! is exercisable under `tokio::time::pause`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

/// One cached value with its absolute expiry instant.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    expires_at: Instant,
}

/// Cache usage counters.
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub invalidations: AtomicU64,
    pub swept: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheCountersSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub swept: u64,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CacheCountersSnapshot {
        CacheCountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Hit rate over all reads so far (0.0 when no reads).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// TTL'd key/value store shared by the read routes and change bridge.
///
/// All mutation goes through this contract; callers never iterate the
/// map except the reconciler's `sweep`.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    counters: CacheCounters,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the canonical `topic:rest` key.
    pub fn key(topic: &str, rest: &str) -> String {
        format!("{}:{}", topic, rest)
    }

    /// Look up a key. An entry at or past its expiry instant is removed
    /// and reported as a miss.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            // Re-check expiry under the entry lock: a concurrent set may
            // have refreshed the key between the read above and here.
            self.entries
                .remove_if(key, |_, entry| Instant::now() >= entry.expires_at);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite a key, resetting its expiry to now + ttl.
    /// Last writer wins.
    pub fn set(&self, key: impl Into<String>, value: JsonValue, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.into(), entry);
    }

    /// Remove one key immediately, distinct from passive expiry.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every key scoped under a topic. Coarse by design; the
    /// staleness window this protects against is seconds, not minutes.
    pub fn invalidate_topic(&self, topic: &str) -> usize {
        let prefix = format!("{}:", topic);
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.starts_with(&prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Drop entries already past expiry. Called only by the reconciler.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.counters
                .swept
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_get_after_expiry_is_miss() {
        let cache = CacheStore::new();
        cache.set("answers:U1-L2-Q01", json!([1, 2]), Duration::from_secs(30));
        assert_eq!(cache.get("answers:U1-L2-Q01"), Some(json!([1, 2])));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("answers:U1-L2-Q01"), None);
        // The lazy reap removed the entry, not just hid it.
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_miss_regardless_of_prior_reads() {
        let cache = CacheStore::new();
        cache.set("votes:Q1", json!(1), Duration::from_secs(10));
        for _ in 0..5 {
            assert!(cache.get("votes:Q1").is_some());
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("votes:Q1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_expiry() {
        let cache = CacheStore::new();
        cache.set("answers:Q1", json!("old"), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("answers:Q1", json!("new"), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        // 16s after the first set, 8s after the overwrite: still live,
        // and the later writer's value is the one served.
        assert_eq!(cache.get("answers:Q1"), Some(json!("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_beats_ttl() {
        let cache = CacheStore::new();
        cache.set("answers:U1-L2-Q01", json!(1), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.invalidate("answers:U1-L2-Q01"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("answers:U1-L2-Q01"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_topic_is_scoped() {
        let cache = CacheStore::new();
        cache.set("answers:Q1", json!(1), Duration::from_secs(30));
        cache.set("answers:Q2", json!(2), Duration::from_secs(30));
        cache.set("votes:Q1", json!(3), Duration::from_secs(30));

        assert_eq!(cache.invalidate_topic("answers"), 2);
        assert_eq!(cache.get("answers:Q1"), None);
        assert_eq!(cache.get("answers:Q2"), None);
        assert_eq!(cache.get("votes:Q1"), Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reaps_abandoned_entries() {
        let cache = CacheStore::new();
        cache.set("answers:Q1", json!(1), Duration::from_secs(5));
        cache.set("answers:Q2", json!(2), Duration::from_secs(120));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("answers:Q2"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_track_reads() {
        let cache = CacheStore::new();
        cache.set("answers:Q1", json!(1), Duration::from_secs(30));
        cache.get("answers:Q1");
        cache.get("answers:missing");
        let snapshot = cache.counters().snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!((cache.counters().hit_rate() - 0.5).abs() < 0.001);
    }

    proptest! {
        /// Any entry read strictly after its TTL elapses is a miss,
        /// whatever the TTL was.
        #[test]
        fn prop_expired_reads_always_miss(ttl_ms in 1u64..60_000) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .expect("runtime");
            rt.block_on(async {
                let cache = CacheStore::new();
                cache.set("answers:Q1", json!(true), Duration::from_millis(ttl_ms));
                tokio::time::advance(Duration::from_millis(ttl_ms + 1)).await;
                prop_assert!(cache.get("answers:Q1").is_none());
                Ok(())
            })?;
        }
    }
}
