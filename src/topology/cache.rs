//! Generic TTL cache with per-key single-flight refresh.
//!
//! Exactly one caller refreshes an expired key at a time. Everyone else is
//! served a bounded-stale value while the refresh is in flight, trading a
//! staleness window of at most `ttl + deferment_window` for avoiding a
//! refresh storm against the authoritative registry.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A cached value with its fetch timestamp.
#[derive(Debug, Clone)]
struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

/// TTL cache with single-flight refresh and a stale-serve deferment window.
///
/// Instances are constructed and injected into their owner, never
/// process-global, so tests can run isolated caches per case.
#[derive(Debug)]
pub struct SingleFlightCache<K: Eq + Hash, V> {
    entries: RwLock<HashMap<K, Cached<V>>>,
    /// Per-key refresh locks. An occupied entry means a refresh is running.
    refreshing: DashMap<K, ()>,
    ttl: Duration,
    deferment_window: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create a cache with the given freshness TTL and deferment window.
    pub fn new(
        ttl: Duration,
        deferment_window: Duration,
        retry_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refreshing: DashMap::new(),
            ttl,
            deferment_window,
            retry_attempts: retry_attempts.max(1),
            retry_backoff,
        }
    }

    /// Get a fresh value, refreshing through `fetch` when needed.
    ///
    /// Policy: fresh -> serve. Expired -> the caller that wins the key's
    /// refresh lock fetches and overwrites; losers serve the stale value if
    /// its age is within `ttl + deferment_window`, otherwise back off and
    /// re-check up to the retry budget, then fail with `ResourceLocked`.
    pub async fn get_or_refresh<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut fetch = Some(fetch);

        for attempt in 0..self.retry_attempts {
            if let Some(cached) = self.lookup(&key) {
                if cached.fetched_at.elapsed() <= self.ttl {
                    return Ok(cached.value);
                }
            }

            // Expired or absent: race for the refresh lock.
            if self.try_lock(&key) {
                // The winner path returns unconditionally, so the closure is
                // still available here.
                let Some(fetch) = fetch.take() else {
                    self.unlock(&key);
                    return Err(Error::Internal("refresh closure consumed twice".into()));
                };
                let result = fetch().await;
                self.unlock(&key);
                return match result {
                    Ok(value) => {
                        self.insert(key, value.clone());
                        Ok(value)
                    }
                    Err(e) => Err(e),
                };
            }

            // Another caller is refreshing. Serve bounded-stale if we can.
            if let Some(cached) = self.lookup(&key) {
                if cached.fetched_at.elapsed() <= self.ttl + self.deferment_window {
                    tracing::debug!(?key, "serving stale topology value during refresh");
                    return Ok(cached.value);
                }
            }

            tracing::debug!(?key, attempt, "topology refresh contended, backing off");
            tokio::time::sleep(self.retry_backoff).await;
        }

        Err(Error::ResourceLocked {
            key: format!("{key:?}"),
        })
    }

    /// Unconditional immediate overwrite with a fresh timestamp.
    ///
    /// Used right after a topology change so subsequent lookups see the new
    /// value without waiting for TTL expiry.
    pub fn invalidate(&self, key: K, value: V) {
        self.insert(key, value);
    }

    fn lookup(&self, key: &K) -> Option<Cached<V>> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: K, value: V) {
        self.entries.write().insert(
            key,
            Cached {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Non-blocking put-if-absent on the key's refresh lock.
    fn try_lock(&self, key: &K) -> bool {
        match self.refreshing.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn unlock(&self, key: &K) {
        self.refreshing.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, deferment_ms: u64) -> SingleFlightCache<String, Vec<String>> {
        SingleFlightCache::new(
            Duration::from_millis(ttl_ms),
            Duration::from_millis(deferment_ms),
            3,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_fetches_on_miss_and_serves_fresh() {
        let cache = cache(1000, 2000);
        let value = cache
            .get_or_refresh("k".to_string(), || async { Ok(vec!["e1".to_string()]) })
            .await
            .unwrap();
        assert_eq!(value, vec!["e1".to_string()]);

        // Second call must not fetch.
        let value = cache
            .get_or_refresh("k".to_string(), || async {
                panic!("fresh value should be served from cache")
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["e1".to_string()]);
    }

    #[tokio::test]
    async fn test_serves_stale_within_deferment_under_contention() {
        let cache = cache(0, 5000);
        cache.invalidate("k".to_string(), vec!["stale".to_string()]);
        // TTL of zero makes the value instantly expired but well inside the
        // deferment window. Hold the refresh lock to simulate a concurrent
        // refresher.
        assert!(cache.try_lock(&"k".to_string()));

        let value = cache
            .get_or_refresh("k".to_string(), || async {
                panic!("loser must not fetch while the lock is held")
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn test_resource_locked_when_stale_beyond_deferment() {
        let cache = cache(0, 0);
        cache.invalidate("k".to_string(), vec!["old".to_string()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.try_lock(&"k".to_string()));

        let err = cache
            .get_or_refresh("k".to_string(), || async { Ok(vec![]) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceLocked { .. }));
    }

    #[tokio::test]
    async fn test_contended_caller_picks_up_winner_result() {
        let cache = cache(1000, 2000);
        assert!(cache.try_lock(&"k".to_string()));

        // Winner publishes while the loser is backing off.
        cache.invalidate("k".to_string(), vec!["published".to_string()]);
        cache.unlock(&"k".to_string());

        let value = cache
            .get_or_refresh("k".to_string(), || async {
                panic!("value was already published")
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["published".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_overwrites_immediately() {
        let cache = cache(60_000, 60_000);
        cache.invalidate("k".to_string(), vec!["v1".to_string()]);
        cache.invalidate("k".to_string(), vec!["v2".to_string()]);

        let value = cache
            .get_or_refresh("k".to_string(), || async { unreachable!() })
            .await
            .unwrap();
        assert_eq!(value, vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_error_propagates_and_releases_lock() {
        let cache = cache(1000, 2000);
        let err = cache
            .get_or_refresh("k".to_string(), || async {
                Err(Error::Internal("registry down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // Lock must be released so the next caller can fetch.
        let value = cache
            .get_or_refresh("k".to_string(), || async { Ok(vec!["ok".to_string()]) })
            .await
            .unwrap();
        assert_eq!(value, vec!["ok".to_string()]);
    }
}
