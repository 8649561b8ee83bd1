//! Cache layer scenarios: stampede protection, key round-trips, and
//! warm-up driven by access patterns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use opscore::cache::{CacheService, CacheWarmer, WarmOptions, WarmTask};
use opscore::config::CacheConfig;
use opscore::store::{InMemoryStore, KeyValueStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
}

fn cache_with_store() -> (Arc<CacheService>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(CacheService::new(store.clone(), &CacheConfig::default()));
    (cache, store)
}

/// Three concurrent get_or_compute calls on a missing key invoke the
/// fallback exactly once, all receive the same value, and the key ends up
/// present with roughly the requested TTL.
#[tokio::test]
async fn test_stampede_protection() {
    let (cache, store) = cache_with_store();
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let cache = cache.clone();
        let fetches = fetches.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(
                    "user",
                    "profile",
                    "123",
                    move || {
                        let fetches = fetches.clone();
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
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
        assert_eq!(
            handle.await.unwrap(),
            Profile {
                id: 1,
                name: "test".into()
            }
        );
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(store.exists("rdp:user:profile:123:v1").await.unwrap());

    let ttl = store.ttl("rdp:user:profile:123:v1").await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(3500));
    assert!(ttl <= Duration::from_secs(3600));

    // The lock must not survive the computation.
    assert!(!store
        .exists("lock:rdp:user:profile:123:v1")
        .await
        .unwrap());
}

/// set/get/del/exists round-trip through structured keys.
#[tokio::test]
async fn test_structured_roundtrip() {
    let (cache, _) = cache_with_store();
    let profile = Profile {
        id: 9,
        name: "nine".into(),
    };

    cache
        .set("user", "profile", "9", &profile, None)
        .await
        .unwrap();
    assert_eq!(
        cache.get::<Profile>("user", "profile", "9").await.unwrap(),
        Some(profile)
    );

    assert!(cache.del("user", "profile", "9").await.unwrap());
    assert!(!cache.exists("user", "profile", "9").await.unwrap());
    assert_eq!(
        cache.get::<Profile>("user", "profile", "9").await.unwrap(),
        None
    );
}

/// Access misses routed into the warmer trigger an on-demand warm once the
/// key is hot enough, which fills the cache for subsequent reads.
#[tokio::test]
async fn test_access_driven_warm_fills_cache() {
    let (cache, _) = cache_with_store();
    let warmer = Arc::new(CacheWarmer::new(cache.clone(), &CacheConfig::default()));
    {
        let warmer = warmer.clone();
        cache.set_access_listener(Arc::new(move |key, hit| warmer.record_access(key, hit)));
    }

    let key = cache.key("user", "profile", "hot").unwrap();
    warmer
        .register_task(WarmTask {
            key: key.clone(),
            fetcher: Arc::new(|| {
                Box::pin(async {
                    Ok(Some(serde_json::json!({"id": 7, "name": "warmed"})))
                })
            }),
            options: WarmOptions {
                // Minimum threshold: 20 recent accesses.
                priority: 10,
                ..Default::default()
            },
        })
        .unwrap();

    for _ in 0..20 {
        let _: Option<Profile> = cache.get("user", "profile", "hot").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let warmed: Option<Profile> = cache.get("user", "profile", "hot").await.unwrap();
    assert_eq!(
        warmed,
        Some(Profile {
            id: 7,
            name: "warmed".into()
        })
    );
    assert!(warmer.stats().successes >= 1);
}

/// Startup warm-up respects priorities and fills every registered key.
#[tokio::test]
async fn test_startup_warm_order_and_content() {
    let (cache, _) = cache_with_store();
    // Serial execution makes the priority ordering observable.
    let config = CacheConfig {
        warm_concurrency: 1,
        ..Default::default()
    };
    let warmer = Arc::new(CacheWarmer::new(cache.clone(), &config));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for (key, priority) in [("warm:low", 9u8), ("warm:high", 1u8)] {
        let order = order.clone();
        warmer
            .register_task(WarmTask {
                key: key.to_string(),
                fetcher: Arc::new(move || {
                    let order = order.clone();
                    let key = key.to_string();
                    Box::pin(async move {
                        order.lock().push(key.clone());
                        Ok(Some(serde_json::json!(key)))
                    })
                }),
                options: WarmOptions {
                    priority,
                    ..Default::default()
                },
            })
            .unwrap();
    }

    let report = warmer.warm_on_startup().await;
    assert_eq!(report.successful.len(), 2);
    assert!(report.failed.is_empty());
    // Priority 1 runs before priority 9.
    assert_eq!(order.lock().first().map(String::as_str), Some("warm:high"));

    let low: Option<String> = cache.get_raw("warm:low").await.unwrap();
    assert_eq!(low.as_deref(), Some("warm:low"));
}
