//! Stampede-protected cache over the key-value store.
//!
//! Values are JSON-encoded under structured keys. `get_or_compute` is the
//! flagship operation: on a miss it takes the per-key lock, double-checks
//! the key (a concurrent holder may have filled it), computes the fallback
//! once, writes it, and releases. Losers of the lock race sleep briefly and
//! retry the whole operation; the lock TTL bounds how long a dead holder can
//! make them wait.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::key::CacheKeyBuilder;
use crate::cache::lock::CacheLock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Delay before a lock-race loser re-checks the key.
const CONTENTION_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Observer invoked on every structured read with `(key, was_hit)`; the
/// warmer uses this to drive on-demand warm-up.
pub type AccessListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

pub struct CacheService {
    store: Arc<dyn KeyValueStore>,
    lock: CacheLock,
    keys: CacheKeyBuilder,
    default_ttl_secs: AtomicU64,
    lock_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    access_listener: RwLock<Option<AccessListener>>,
}

impl CacheService {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            lock: CacheLock::new(store.clone()),
            store,
            keys: CacheKeyBuilder::new(&config.key_prefix, &config.key_version),
            default_ttl_secs: AtomicU64::new(config.default_ttl_secs),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            access_listener: RwLock::new(None),
        }
    }

    pub fn set_access_listener(&self, listener: AccessListener) {
        *self.access_listener.write() = Some(listener);
    }

    pub fn key(&self, entity: &str, operation: &str, identifier: &str) -> Result<String> {
        self.keys.build(entity, operation, identifier)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs.load(Ordering::SeqCst))
    }

    pub fn set_default_ttl(&self, ttl: Duration) {
        self.default_ttl_secs.store(ttl.as_secs(), Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    fn record_access(&self, key: &str, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::SeqCst);
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(listener) = self.access_listener.read().as_ref() {
            listener(key, hit);
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        entity: &str,
        operation: &str,
        identifier: &str,
    ) -> Result<Option<T>> {
        let key = self.key(entity, operation, identifier)?;
        let value = self.get_raw(&key).await?;
        self.record_access(&key, value.is_some());
        Ok(value)
    }

    pub async fn set<T: Serialize>(
        &self,
        entity: &str,
        operation: &str,
        identifier: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.key(entity, operation, identifier)?;
        self.set_raw(&key, value, ttl.unwrap_or_else(|| self.default_ttl()))
            .await
    }

    pub async fn del(&self, entity: &str, operation: &str, identifier: &str) -> Result<bool> {
        let key = self.key(entity, operation, identifier)?;
        self.store.delete(&key).await
    }

    pub async fn exists(&self, entity: &str, operation: &str, identifier: &str) -> Result<bool> {
        let key = self.key(entity, operation, identifier)?;
        self.store.exists(&key).await
    }

    pub async fn ttl(
        &self,
        entity: &str,
        operation: &str,
        identifier: &str,
    ) -> Result<Option<Duration>> {
        let key = self.key(entity, operation, identifier)?;
        self.store.ttl(&key).await
    }

    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<Option<T>>> {
        let raw = self.store.get_many(keys).await?;
        raw.into_iter()
            .map(|v| v.map(|s| serde_json::from_str(&s)).transpose())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn get_raw<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    pub async fn set_raw<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.store.set(key, &encoded, Some(ttl)).await
    }

    /// Return the cached value or compute it exactly once per lock-holder
    /// epoch, no matter how many callers miss concurrently.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        entity: &str,
        operation: &str,
        identifier: &str,
        fallback: F,
        ttl: Duration,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = self.key(entity, operation, identifier)?;
        let mut first_check = true;

        loop {
            if let Some(value) = self.get_raw::<T>(&key).await? {
                if first_check {
                    self.record_access(&key, true);
                }
                return Ok(value);
            }
            if first_check {
                self.record_access(&key, false);
                first_check = false;
            }

            if self.lock.acquire(&key, self.lock_ttl).await? {
                let outcome = self.compute_and_store(&key, &fallback, ttl).await;
                // Release no matter how the computation went.
                let _ = self.lock.release(&key).await;
                return outcome;
            }

            debug!("lock contention on {}, retrying", key);
            tokio::time::sleep(CONTENTION_RETRY_DELAY).await;
        }
    }

    async fn compute_and_store<T, F, Fut>(&self, key: &str, fallback: &F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Double-check: the previous holder may have filled the key between
        // our miss and our acquire.
        if let Some(value) = self.get_raw::<T>(key).await? {
            return Ok(value);
        }
        let value = fallback().await?;
        self.set_raw(key, &value, ttl).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    fn cache() -> Arc<CacheService> {
        Arc::new(CacheService::new(
            Arc::new(InMemoryStore::new()),
            &CacheConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_set_get_roundtrip_and_del() {
        let cache = cache();
        let profile = Profile {
            id: 1,
            name: "test".into(),
        };

        cache
            .set("user", "profile", "1", &profile, None)
            .await
            .unwrap();
        let loaded: Option<Profile> = cache.get("user", "profile", "1").await.unwrap();
        assert_eq!(loaded, Some(profile));
        assert!(cache.exists("user", "profile", "1").await.unwrap());

        assert!(cache.del("user", "profile", "1").await.unwrap());
        assert!(!cache.exists("user", "profile", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_key_is_validation_error() {
        let cache = cache();
        let result: Result<Option<Profile>> = cache.get("user", "pro file", "1").await;
        assert!(matches!(
            result,
            Err(crate::error::OpsError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_applied_on_set() {
        let cache = cache();
        cache
            .set("user", "profile", "9", &1u32, Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        let remaining = cache.ttl("user", "profile", "9").await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(3590));
        assert!(remaining <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_mget_mixed_presence() {
        let cache = cache();
        cache.set("user", "profile", "1", &10u32, None).await.unwrap();
        cache.set("user", "profile", "3", &30u32, None).await.unwrap();

        let keys = vec![
            cache.key("user", "profile", "1").unwrap(),
            cache.key("user", "profile", "2").unwrap(),
            cache.key("user", "profile", "3").unwrap(),
        ];
        let values: Vec<Option<u32>> = cache.mget(&keys).await.unwrap();
        assert_eq!(values, vec![Some(10), None, Some(30)]);
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "user",
                        "profile",
                        "123",
                        move || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Ok(Profile {
                                    id: 1,
                                    name: "test".into(),
                                })
                            }
                        },
                        Duration::from_secs(3600),
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap();
            assert_eq!(
                value,
                Profile {
                    id: 1,
                    name: "test".into()
                }
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let remaining = cache.ttl("user", "profile", "123").await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn test_get_or_compute_skips_fallback_on_hit() {
        let cache = cache();
        cache.set("user", "profile", "7", &5u32, None).await.unwrap();

        let value: u32 = cache
            .get_or_compute(
                "user",
                "profile",
                "7",
                || async { panic!("fallback must not run on a hit") },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_fallback_error_releases_lock() {
        let cache = cache();

        let result: Result<u32> = cache
            .get_or_compute(
                "user",
                "profile",
                "err",
                || async { Err(crate::error::OpsError::Transient("upstream down".into())) },
                Duration::from_secs(60),
            )
            .await;
        assert!(result.is_err());

        // The lock must be free again for the next caller.
        let value: u32 = cache
            .get_or_compute(
                "user",
                "profile",
                "err",
                || async { Ok(42) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_stats_and_listener_track_hits_and_misses() {
        let cache = cache();
        let listened = Arc::new(AtomicUsize::new(0));
        let l = listened.clone();
        cache.set_access_listener(Arc::new(move |_key, _hit| {
            l.fetch_add(1, Ordering::SeqCst);
        }));

        let _: Option<u32> = cache.get("user", "profile", "1").await.unwrap();
        cache.set("user", "profile", "1", &1u32, None).await.unwrap();
        let _: Option<u32> = cache.get("user", "profile", "1").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(listened.load(Ordering::SeqCst), 2);
    }
}
