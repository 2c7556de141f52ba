//! Cache-aside layer over the store.
//!
//! The cache never fails a request: store errors are logged and turned into
//! misses (`get`), `false` (`set`/`delete`) or `0` (`delete_pattern`). While
//! the store is known to be down it is not touched at all.
//!
//! Concurrent misses on one key may each run the compute function; there is
//! no stampede protection.
//!
//! Every key carries a prefix. An empty prefix means [`DEFAULT_PREFIX`], so
//! cache calls never reach the queue or rate-limit keyspaces sharing the store.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::store::{Connection, StoreHealth};

/// Prefix used when callers have no namespace of their own.
pub const DEFAULT_PREFIX: &str = "cache";

/// Default TTLs per data class. Any TTL may be passed per call.
pub struct CacheTtl;

impl CacheTtl {
    pub const ORDER: Duration = Duration::from_secs(5 * 60);
    pub const USER_PROFILE: Duration = Duration::from_secs(10 * 60);
    pub const SERVICES: Duration = Duration::from_secs(60 * 60);
    pub const CATEGORIES: Duration = Duration::from_secs(24 * 60 * 60);
}

/// Well-known keys (without the prefix).
pub struct CacheKeys;

impl CacheKeys {
    pub const SERVICES_LIST: &'static str = "services:list";
    pub const CATEGORY_TREE: &'static str = "categories:tree";

    pub fn order(id: impl std::fmt::Display) -> String {
        format!("order:{id}")
    }

    pub fn user_profile(id: impl std::fmt::Display) -> String {
        format!("user:{id}:profile")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub available: bool,
    pub keys: u64,
    pub used_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Cache {
    conn: Connection,
    health: StoreHealth,
}

fn full_key(prefix: &str, key: &str) -> String {
    let prefix = if prefix.is_empty() {
        DEFAULT_PREFIX
    } else {
        prefix
    };
    format!("{prefix}:{key}")
}

impl Cache {
    pub fn new(conn: Connection, health: StoreHealth) -> Self {
        Self { conn, health }
    }

    fn enabled(&self) -> bool {
        !self.health.is_down()
    }

    /// `None` on miss, expiry, undecodable value or store failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, prefix: &str) -> Option<T> {
        if !self.enabled() {
            return None;
        }
        let key = full_key(prefix, key);
        let raw = match self.conn.store().get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %key, error = %e, "cache get failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "cached value did not decode, treating as miss");
                None
            }
        }
    }

    /// Store `value` under `ttl` in one write. Returns whether it was stored.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        prefix: &str,
    ) -> bool {
        if !self.enabled() {
            return false;
        }
        let key = full_key(prefix, key);
        let body = match serde_json::to_string(value) {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %key, error = %e, "cache value did not serialize");
                return false;
            }
        };
        match self.conn.store().set(&key, &body, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "cache set failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str, prefix: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        let key = full_key(prefix, key);
        match self.conn.store().del(std::slice::from_ref(&key)).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(key = %key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Delete every key matching `pattern` within `prefix`. Returns how many
    /// were removed.
    pub async fn delete_pattern(&self, pattern: &str, prefix: &str) -> u64 {
        if !self.enabled() {
            return 0;
        }
        let pattern = full_key(prefix, pattern);
        let store = self.conn.store();
        let result = match store.scan_match(&pattern).await {
            Ok(keys) => store.del(&keys).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(n) => {
                debug!(pattern = %pattern, removed = n, "cache pattern invalidated");
                n
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "cache pattern delete failed");
                0
            }
        }
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// Errors from `compute` come from the source of truth and are returned
    /// unchanged; nothing is cached in that case.
    pub async fn cache_aside<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        prefix: &str,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key, prefix).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, &value, ttl, prefix).await;
        Ok(value)
    }

    /// Key count under [`DEFAULT_PREFIX`] plus the store's memory figure.
    pub async fn stats(&self) -> CacheStats {
        if !self.enabled() {
            return CacheStats::default();
        }
        let store = self.conn.store();
        let keys = store.scan_match(&full_key(DEFAULT_PREFIX, "*")).await;
        let memory = store.used_memory().await;
        match (keys, memory) {
            (Ok(keys), Ok(used_memory_bytes)) => CacheStats {
                available: true,
                keys: keys.len() as u64,
                used_memory_bytes,
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "cache stats unavailable");
                CacheStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::clock::MockClock;
    use crate::jobs::{EnqueueOptions, JobQueue, QueueName, QueuePolicy};
    use crate::store::{MemoryStore, Purpose, Store};

    struct Fixture {
        cache: Cache,
        clock: MockClock,
        store: Arc<MemoryStore>,
        health: StoreHealth,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let health = StoreHealth::new();
        let cache = Cache::new(Connection::new(Purpose::Cache, store.clone()), health.clone());
        Fixture {
            cache,
            clock,
            store,
            health,
        }
    }

    #[tokio::test]
    async fn set_then_get_until_ttl_elapses() {
        let f = fixture();
        let order = serde_json::json!({"id": 17, "status": "paid"});
        assert!(f.cache.set("order:17", &order, CacheTtl::ORDER, DEFAULT_PREFIX).await);
        assert_eq!(
            f.cache
                .get::<serde_json::Value>("order:17", DEFAULT_PREFIX)
                .await,
            Some(order)
        );

        f.clock.advance(CacheTtl::ORDER);
        assert_eq!(
            f.cache
                .get::<serde_json::Value>("order:17", DEFAULT_PREFIX)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn cache_aside_computes_once() {
        let f = fixture();
        let calls = AtomicU32::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(vec!["haircut".to_string(), "massage".to_string()])
        };

        let first = f
            .cache
            .cache_aside(CacheKeys::SERVICES_LIST, CacheTtl::SERVICES, DEFAULT_PREFIX, compute)
            .await
            .unwrap();
        let second = f
            .cache
            .cache_aside(CacheKeys::SERVICES_LIST, CacheTtl::SERVICES, DEFAULT_PREFIX, compute)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get("cache:services:list").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compute_errors_propagate_and_are_not_cached() {
        let f = fixture();
        let result: Result<u32, &str> = f
            .cache
            .cache_aside("k", CacheTtl::ORDER, DEFAULT_PREFIX, || async { Err("db down") })
            .await;
        assert_eq!(result, Err("db down"));
        assert_eq!(f.cache.get::<u32>("k", DEFAULT_PREFIX).await, None);
    }

    #[tokio::test]
    async fn delete_pattern_removes_only_matching_keys() {
        let f = fixture();
        for key in ["a:1", "a:2", "b:1"] {
            assert!(f.cache.set(key, &key, CacheTtl::ORDER, DEFAULT_PREFIX).await);
        }

        assert_eq!(f.cache.delete_pattern("a:*", DEFAULT_PREFIX).await, 2);
        assert_eq!(f.cache.get::<String>("a:1", DEFAULT_PREFIX).await, None);
        assert_eq!(
            f.cache.get::<String>("b:1", DEFAULT_PREFIX).await.as_deref(),
            Some("b:1")
        );
        assert!(f.cache.delete("b:1", DEFAULT_PREFIX).await);
        assert!(!f.cache.delete("b:1", DEFAULT_PREFIX).await);
    }

    #[tokio::test]
    async fn undecodable_value_is_a_miss() {
        let f = fixture();
        f.store.set("cache:n", "not json", None).await.unwrap();
        assert_eq!(f.cache.get::<u32>("n", DEFAULT_PREFIX).await, None);
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_always_miss() {
        let f = fixture();
        f.store.set_available(false);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let value = f
                .cache
                .cache_aside("tree", CacheTtl::CATEGORIES, DEFAULT_PREFIX, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!f.cache.set("x", &1, CacheTtl::ORDER, DEFAULT_PREFIX).await);
        assert_eq!(f.cache.delete_pattern("*", DEFAULT_PREFIX).await, 0);
        assert!(!f.cache.stats().await.available);
    }

    #[tokio::test]
    async fn known_down_store_is_not_touched() {
        let f = fixture();
        f.cache.set("k", &1, CacheTtl::ORDER, DEFAULT_PREFIX).await;
        f.health.record(false);
        assert_eq!(f.cache.get::<u32>("k", DEFAULT_PREFIX).await, None);

        f.health.record(true);
        assert_eq!(f.cache.get::<u32>("k", DEFAULT_PREFIX).await, Some(1));
    }

    #[tokio::test]
    async fn stats_report_key_count() {
        let f = fixture();
        f.cache.set("a", &1, CacheTtl::ORDER, DEFAULT_PREFIX).await;
        f.cache.set("b", &2, CacheTtl::ORDER, DEFAULT_PREFIX).await;
        let stats = f.cache.stats().await;
        assert!(stats.available);
        assert_eq!(stats.keys, 2);
        assert!(stats.used_memory_bytes.is_some());
    }

    #[tokio::test]
    async fn stats_ignore_queue_and_rate_limit_keys() {
        let f = fixture();
        f.cache.set("a", &1, CacheTtl::ORDER, DEFAULT_PREFIX).await;
        let before = f.cache.stats().await.keys;

        let queue = JobQueue::new(
            QueueName::EmailNotification,
            QueuePolicy::for_queue(QueueName::EmailNotification),
            Connection::new(Purpose::Queue, f.store.clone()),
            Arc::new(f.clock.clone()),
        );
        queue
            .enqueue("send", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        f.store
            .set("ratelimit:auth:198.51.100.7:blocked", "1", None)
            .await
            .unwrap();

        assert_eq!(before, 1);
        assert_eq!(f.cache.stats().await.keys, before);
    }

    #[tokio::test]
    async fn empty_prefix_stays_inside_the_cache_namespace() {
        let f = fixture();
        f.store
            .set("queue:email-notification:job:1", "{}", None)
            .await
            .unwrap();
        assert!(f.cache.set("order:1", &1, CacheTtl::ORDER, "").await);
        assert!(f.store.get("cache:order:1").await.unwrap().is_some());

        assert_eq!(f.cache.delete_pattern("*", "").await, 1);
        assert!(
            f.store
                .get("queue:email-notification:job:1")
                .await
                .unwrap()
                .is_some()
        );
    }
}
