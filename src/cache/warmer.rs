//! Cache warm-up: startup batches, scheduled refreshes, and access-driven
//! on-demand warming.
//!
//! All three triggers share one task executor: run the fetcher, store any
//! non-null value with the task's TTL, and keep success/failure counters
//! plus a rolling mean latency. On-demand warming adapts its own trigger
//! threshold, loosening after failures and tightening after successes.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::service::CacheService;
use crate::config::CacheConfig;
use crate::error::{OpsError, Result};
use crate::monitoring::adapters::{CacheServiceAdapter, CacheServiceStats};
use crate::retry::{RetryConfig, RetryPolicy};

const ACCESS_WINDOW: Duration = Duration::from_secs(3_600);
const ON_DEMAND_COOLDOWN: Duration = Duration::from_secs(300);
const THRESHOLD_FLOOR: f64 = 20.0;
const THRESHOLD_CEILING: f64 = 200.0;

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WarmOptions {
    /// 1 is warmed first, 10 last.
    pub priority: u8,
    pub ttl: Duration,
    /// Core tasks are the ones re-run by `prewarm`.
    pub is_core: bool,
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub is_scheduled: bool,
    /// Only the `"0 */N * * *"` form is accepted, meaning every N hours.
    pub schedule: Option<String>,
}

impl Default for WarmOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            ttl: Duration::from_secs(3_600),
            is_core: false,
            retry_times: 3,
            retry_delay: Duration::from_millis(1_000),
            is_scheduled: false,
            schedule: None,
        }
    }
}

#[derive(Clone)]
pub struct WarmTask {
    pub key: String,
    pub fetcher: FetchFn,
    pub options: WarmOptions,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmerStats {
    pub executed: u64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupWarmReport {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed_ms: u64,
}

struct AccessState {
    hits: u64,
    misses: u64,
    window: VecDeque<Instant>,
    threshold: f64,
    last_warm: Option<Instant>,
}

impl AccessState {
    fn new(priority: u8) -> Self {
        Self {
            hits: 0,
            misses: 0,
            window: VecDeque::new(),
            threshold: (100.0 - priority as f64 * 10.0).max(THRESHOLD_FLOOR),
            last_warm: None,
        }
    }

    fn record(&mut self, hit: bool, now: Instant) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.window.push_back(now);
        while self
            .window
            .front()
            .is_some_and(|t| now.duration_since(*t) > ACCESS_WINDOW)
        {
            self.window.pop_front();
        }
    }
}

pub struct CacheWarmer {
    cache: Arc<CacheService>,
    tasks: RwLock<HashMap<String, WarmTask>>,
    stats: Mutex<WarmerStats>,
    total_latency_ms: Mutex<f64>,
    access: Mutex<HashMap<String, AccessState>>,
    in_flight: Mutex<HashSet<String>>,
    concurrency: usize,
    startup_timeout: Duration,
    scheduled_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<CacheService>, config: &CacheConfig) -> Self {
        Self {
            cache,
            tasks: RwLock::new(HashMap::new()),
            stats: Mutex::new(WarmerStats::default()),
            total_latency_ms: Mutex::new(0.0),
            access: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            concurrency: config.warm_concurrency,
            startup_timeout: Duration::from_secs(config.warm_timeout_secs),
            scheduled_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a warm task. Scheduled tasks must carry a parseable cron
    /// expression; the check happens here rather than at first tick.
    pub fn register_task(&self, task: WarmTask) -> Result<()> {
        if task.key.is_empty() {
            return Err(OpsError::Config("warm task key must not be empty".into()));
        }
        if !(1..=10).contains(&task.options.priority) {
            return Err(OpsError::Config(format!(
                "warm task {} priority must be 1-10",
                task.key
            )));
        }
        if task.options.is_scheduled {
            let Some(schedule) = &task.options.schedule else {
                return Err(OpsError::Config(format!(
                    "scheduled warm task {} needs a schedule",
                    task.key
                )));
            };
            parse_hourly_cron(schedule)?;
        }
        debug!("registered warm task {}", task.key);
        self.tasks.write().insert(task.key.clone(), task);
        Ok(())
    }

    pub fn stats(&self) -> WarmerStats {
        self.stats.lock().clone()
    }

    /// Run a single warm task: fetch, store non-null values, update stats.
    pub async fn execute_task(&self, task: &WarmTask) -> bool {
        let start = Instant::now();
        let outcome = (task.fetcher)().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let success = match outcome {
            Ok(Some(value)) => {
                match self
                    .cache
                    .set_raw(&task.key, &value, task.options.ttl)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("warm task {} store failed: {}", task.key, e);
                        false
                    }
                }
            }
            // A null fetch result means there is nothing to cache.
            Ok(None) => true,
            Err(e) => {
                warn!("warm task {} fetch failed: {}", task.key, e);
                false
            }
        };

        let mut stats = self.stats.lock();
        stats.executed += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        let mut total = self.total_latency_ms.lock();
        *total += elapsed_ms;
        stats.mean_latency_ms = *total / stats.executed as f64;

        success
    }

    /// Warm every registered task in priority order with bounded
    /// concurrency and an overall wall-clock budget. Tasks still pending
    /// when the budget runs out are aborted and reported as failed.
    pub async fn warm_on_startup(self: &Arc<Self>) -> StartupWarmReport {
        let started = Instant::now();
        let mut tasks: Vec<WarmTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(|t| t.options.priority);
        let total = tasks.len();
        info!("startup warm-up of {} tasks", total);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set: JoinSet<(String, bool)> = JoinSet::new();
        for task in tasks {
            let warmer = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let success = warmer.execute_task(&task).await;
                (task.key, success)
            });
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let collect = async {
            while let Some(joined) = set.join_next().await {
                if let Ok((key, success)) = joined {
                    if success {
                        successful.push(key);
                    } else {
                        failed.push(key);
                    }
                }
            }
        };

        if tokio::time::timeout(self.startup_timeout, collect).await.is_err() {
            warn!("startup warm-up hit the {:?} budget", self.startup_timeout);
            set.abort_all();
        }

        let finished = successful.len() + failed.len();
        if finished < total {
            let done: HashSet<&String> = successful.iter().chain(failed.iter()).collect();
            let missing: Vec<String> = self
                .tasks
                .read()
                .keys()
                .filter(|k| !done.contains(k))
                .cloned()
                .collect();
            failed.extend(missing);
        }

        StartupWarmReport {
            successful,
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Immediately re-run every core task; used by the cache optimizer.
    pub async fn warm_core(&self) -> usize {
        let core: Vec<WarmTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.options.is_core)
            .cloned()
            .collect();
        let mut warmed = 0;
        for task in core {
            if self.execute_task(&task).await {
                warmed += 1;
            }
        }
        warmed
    }

    /// Start one timer per scheduled task. A tick re-runs the task with the
    /// task's retry budget, unless a previous warm of the same key is still
    /// in flight.
    pub fn start_scheduled(self: &Arc<Self>) {
        let scheduled: Vec<WarmTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.options.is_scheduled)
            .cloned()
            .collect();

        for task in scheduled {
            let interval = match task
                .options
                .schedule
                .as_deref()
                .map(parse_hourly_cron)
                .transpose()
            {
                Ok(Some(interval)) => interval,
                _ => continue,
            };

            info!("scheduling warm task {} every {:?}", task.key, interval);
            let warmer = self.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    warmer.run_scheduled_tick(&task).await;
                }
            });
            self.scheduled_handles.lock().push(handle);
        }
    }

    async fn run_scheduled_tick(self: &Arc<Self>, task: &WarmTask) {
        if !self.in_flight.lock().insert(task.key.clone()) {
            debug!("warm of {} still in flight, skipping tick", task.key);
            return;
        }

        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: task.options.retry_times.max(1),
            initial_delay: task.options.retry_delay,
            ..Default::default()
        });
        let warmer = self.clone();
        let result: std::result::Result<(), String> = policy
            .execute(|| {
                let warmer = warmer.clone();
                let task = task.clone();
                async move {
                    if warmer.execute_task(&task).await {
                        Ok(())
                    } else {
                        Err(format!("warm of {} failed", task.key))
                    }
                }
            })
            .await;

        if let Err(e) = result {
            warn!("scheduled warm gave up: {}", e);
        }
        self.in_flight.lock().remove(&task.key);
    }

    pub fn stop_scheduled(&self) {
        for handle in self.scheduled_handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Feed an access observation. A miss can trigger an async warm when
    /// the key is hot enough and outside the cooldown window.
    pub fn record_access(self: &Arc<Self>, key: &str, is_hit: bool) {
        let Some(task) = self.tasks.read().get(key).cloned() else {
            return;
        };
        let now = Instant::now();

        let should_warm = {
            let mut access = self.access.lock();
            let state = access
                .entry(key.to_string())
                .or_insert_with(|| AccessState::new(task.options.priority));
            state.record(is_hit, now);

            if is_hit {
                false
            } else {
                let hot = state.window.len() as f64 >= state.threshold;
                let cooled = state
                    .last_warm
                    .is_none_or(|at| now.duration_since(at) >= ON_DEMAND_COOLDOWN);
                if hot && cooled {
                    state.last_warm = Some(now);
                    true
                } else {
                    false
                }
            }
        };

        if should_warm {
            info!("on-demand warm triggered for {}", key);
            let warmer = self.clone();
            tokio::spawn(async move {
                let success = {
                    if !warmer.in_flight.lock().insert(task.key.clone()) {
                        return;
                    }
                    let success = warmer.execute_task(&task).await;
                    warmer.in_flight.lock().remove(&task.key);
                    success
                };
                warmer.adapt_threshold(&task.key, success);
            });
        }
    }

    fn adapt_threshold(&self, key: &str, success: bool) {
        let mut access = self.access.lock();
        if let Some(state) = access.get_mut(key) {
            state.threshold = if success {
                (state.threshold * 0.9).max(THRESHOLD_FLOOR)
            } else {
                (state.threshold * 1.2).min(THRESHOLD_CEILING)
            };
        }
    }

    #[cfg(test)]
    fn threshold(&self, key: &str) -> Option<f64> {
        self.access.lock().get(key).map(|s| s.threshold)
    }
}

impl Drop for CacheWarmer {
    fn drop(&mut self) {
        for handle in self.scheduled_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Parse the narrow `"0 */N * * *"` cron form into "every N hours".
fn parse_hourly_cron(expr: &str) -> Result<Duration> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let invalid = || OpsError::Config(format!("unsupported cron expression: {expr:?}"));

    if parts.len() != 5 || parts[0] != "0" || parts[2] != "*" || parts[3] != "*" || parts[4] != "*"
    {
        return Err(invalid());
    }
    let hours: u64 = parts[1]
        .strip_prefix("*/")
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;
    if hours == 0 || hours > 24 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(hours * 3_600))
}

/// Adapter exposing the cache layer to the monitoring façade: hit/miss
/// stats for collectors and rules, TTL and prewarm as optimizer controls.
pub struct CacheMonitoringAdapter {
    cache: Arc<CacheService>,
    warmer: Arc<CacheWarmer>,
}

impl CacheMonitoringAdapter {
    pub fn new(cache: Arc<CacheService>, warmer: Arc<CacheWarmer>) -> Self {
        Self { cache, warmer }
    }
}

#[async_trait]
impl CacheServiceAdapter for CacheMonitoringAdapter {
    async fn stats(&self) -> Result<CacheServiceStats> {
        let stats = self.cache.stats();
        Ok(CacheServiceStats {
            hits: stats.hits,
            misses: stats.misses,
            default_ttl_secs: self.cache.default_ttl().as_secs(),
        })
    }

    async fn apply_ttl(&self, ttl_secs: u64) -> Result<()> {
        self.cache.set_default_ttl(Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn prewarm(&self) -> Result<()> {
        let warmed = self.warmer.warm_core().await;
        info!("prewarm refreshed {} core keys", warmed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> Arc<CacheService> {
        Arc::new(CacheService::new(
            Arc::new(InMemoryStore::new()),
            &CacheConfig::default(),
        ))
    }

    fn warmer(cache: Arc<CacheService>) -> Arc<CacheWarmer> {
        Arc::new(CacheWarmer::new(cache, &CacheConfig::default()))
    }

    fn fetcher_returning(value: Value) -> FetchFn {
        Arc::new(move || {
            let value = value.clone();
            Box::pin(async move { Ok(Some(value)) })
        })
    }

    fn counting_fetcher(calls: Arc<AtomicUsize>, value: Value) -> FetchFn {
        Arc::new(move || {
            let calls = calls.clone();
            let value = value.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(value))
            })
        })
    }

    #[test]
    fn test_cron_parser_narrow_form() {
        assert_eq!(
            parse_hourly_cron("0 */2 * * *").unwrap(),
            Duration::from_secs(7_200)
        );
        assert_eq!(
            parse_hourly_cron("0 */1 * * *").unwrap(),
            Duration::from_secs(3_600)
        );
        assert!(parse_hourly_cron("0 * * * *").is_err());
        assert!(parse_hourly_cron("*/5 * * * *").is_err());
        assert!(parse_hourly_cron("0 */0 * * *").is_err());
        assert!(parse_hourly_cron("0 */2 * *").is_err());
    }

    #[test]
    fn test_register_validation() {
        let warmer = warmer(cache());
        let base = WarmTask {
            key: "rdp:user:list:all:v1".into(),
            fetcher: fetcher_returning(serde_json::json!([1, 2])),
            options: WarmOptions::default(),
        };

        assert!(warmer.register_task(base.clone()).is_ok());

        let mut bad_priority = base.clone();
        bad_priority.key = "k2".into();
        bad_priority.options.priority = 0;
        assert!(warmer.register_task(bad_priority).is_err());

        let mut scheduled_without_cron = base.clone();
        scheduled_without_cron.key = "k3".into();
        scheduled_without_cron.options.is_scheduled = true;
        assert!(warmer.register_task(scheduled_without_cron).is_err());

        let mut scheduled = base;
        scheduled.key = "k4".into();
        scheduled.options.is_scheduled = true;
        scheduled.options.schedule = Some("0 */3 * * *".into());
        assert!(warmer.register_task(scheduled).is_ok());
    }

    #[tokio::test]
    async fn test_execute_task_stores_value_and_counts() {
        let cache = cache();
        let warmer = warmer(cache.clone());
        let task = WarmTask {
            key: "warm:a".into(),
            fetcher: fetcher_returning(serde_json::json!({"n": 1})),
            options: WarmOptions::default(),
        };

        assert!(warmer.execute_task(&task).await);
        let cached: Option<Value> = cache.get_raw("warm:a").await.unwrap();
        assert_eq!(cached, Some(serde_json::json!({"n": 1})));

        let stats = warmer.stats();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn test_execute_task_null_fetch_skips_store() {
        let cache = cache();
        let warmer = warmer(cache.clone());
        let task = WarmTask {
            key: "warm:none".into(),
            fetcher: Arc::new(|| Box::pin(async { Ok(None) })),
            options: WarmOptions::default(),
        };

        assert!(warmer.execute_task(&task).await);
        let cached: Option<Value> = cache.get_raw("warm:none").await.unwrap();
        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn test_execute_task_failure_counts() {
        let warmer = warmer(cache());
        let task = WarmTask {
            key: "warm:bad".into(),
            fetcher: Arc::new(|| {
                Box::pin(async { Err(OpsError::Transient("upstream".into())) })
            }),
            options: WarmOptions::default(),
        };

        assert!(!warmer.execute_task(&task).await);
        assert_eq!(warmer.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_startup_warm_reports_successes_and_failures() {
        let cache = cache();
        let warmer = warmer(cache.clone());

        warmer
            .register_task(WarmTask {
                key: "warm:ok".into(),
                fetcher: fetcher_returning(serde_json::json!(1)),
                options: WarmOptions {
                    priority: 1,
                    ..Default::default()
                },
            })
            .unwrap();
        warmer
            .register_task(WarmTask {
                key: "warm:fail".into(),
                fetcher: Arc::new(|| {
                    Box::pin(async { Err(OpsError::Transient("nope".into())) })
                }),
                options: WarmOptions {
                    priority: 2,
                    ..Default::default()
                },
            })
            .unwrap();

        let report = warmer.warm_on_startup().await;
        assert_eq!(report.successful, vec!["warm:ok".to_string()]);
        assert_eq!(report.failed, vec!["warm:fail".to_string()]);
    }

    #[tokio::test]
    async fn test_startup_warm_times_out() {
        let cache = cache();
        let config = CacheConfig {
            warm_timeout_secs: 0,
            ..Default::default()
        };
        let warmer = Arc::new(CacheWarmer::new(cache, &config));

        warmer
            .register_task(WarmTask {
                key: "warm:slow".into(),
                fetcher: Arc::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(Some(serde_json::json!(1)))
                    })
                }),
                options: WarmOptions::default(),
            })
            .unwrap();

        let report = warmer.warm_on_startup().await;
        assert!(report.successful.is_empty());
        assert_eq!(report.failed, vec!["warm:slow".to_string()]);
    }

    #[tokio::test]
    async fn test_on_demand_warm_triggers_after_threshold() {
        let cache = cache();
        let warmer = warmer(cache.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        warmer
            .register_task(WarmTask {
                key: "hot:key".into(),
                // Priority 10 gives the minimum threshold of 20 accesses.
                fetcher: counting_fetcher(calls.clone(), serde_json::json!("warmed")),
                options: WarmOptions {
                    priority: 10,
                    ..Default::default()
                },
            })
            .unwrap();

        for _ in 0..19 {
            warmer.record_access("hot:key", false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        warmer.record_access("hot:key", false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Within the cooldown no further warms fire.
        for _ in 0..30 {
            warmer.record_access("hot:key", false);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_threshold_adapts_on_success_and_failure() {
        let warmer = warmer(cache());
        warmer
            .register_task(WarmTask {
                key: "adapt:key".into(),
                fetcher: fetcher_returning(serde_json::json!(1)),
                options: WarmOptions {
                    priority: 5,
                    ..Default::default()
                },
            })
            .unwrap();

        warmer.record_access("adapt:key", false);
        assert_eq!(warmer.threshold("adapt:key"), Some(50.0));

        warmer.adapt_threshold("adapt:key", true);
        assert_eq!(warmer.threshold("adapt:key"), Some(45.0));

        for _ in 0..30 {
            warmer.adapt_threshold("adapt:key", false);
        }
        assert_eq!(warmer.threshold("adapt:key"), Some(THRESHOLD_CEILING));

        for _ in 0..100 {
            warmer.adapt_threshold("adapt:key", true);
        }
        assert_eq!(warmer.threshold("adapt:key"), Some(THRESHOLD_FLOOR));
    }

    #[tokio::test]
    async fn test_unregistered_key_access_is_ignored() {
        let warmer = warmer(cache());
        // Must not panic or allocate state.
        warmer.record_access("nobody:home", false);
        assert!(warmer.threshold("nobody:home").is_none());
    }

    #[tokio::test]
    async fn test_monitoring_adapter_reads_and_controls() {
        let cache = cache();
        let warmer = warmer(cache.clone());
        warmer
            .register_task(WarmTask {
                key: "core:key".into(),
                fetcher: fetcher_returning(serde_json::json!("core")),
                options: WarmOptions {
                    is_core: true,
                    ..Default::default()
                },
            })
            .unwrap();

        let adapter = CacheMonitoringAdapter::new(cache.clone(), warmer);
        adapter.apply_ttl(120).await.unwrap();
        assert_eq!(cache.default_ttl(), Duration::from_secs(120));

        adapter.prewarm().await.unwrap();
        let warmed: Option<Value> = cache.get_raw("core:key").await.unwrap();
        assert_eq!(warmed, Some(serde_json::json!("core")));

        let stats = adapter.stats().await.unwrap();
        assert_eq!(stats.default_ttl_secs, 120);
    }
}
