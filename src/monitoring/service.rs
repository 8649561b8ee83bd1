//! Monitoring façade: owns the metric registry, health registry, alert
//! engine, and optimization loop, and wires them together with standard
//! rules, adapter collectors, and the request interceptor.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::adapters::{CacheServiceAdapter, DatabaseAdapter, QueueSystemAdapter};
use super::alerts::{AlertEngine, Comparison};
use super::health::{CheckOptions, HealthRegistry, SystemThresholds};
use super::metrics::{MetricKind, MetricRegistry};
use super::notify::LogNotifier;
use super::optimization::{
    CacheOptimizer, CacheOptimizerConfig, DatabaseOptimizer, DatabaseOptimizerConfig,
    OptimizationLoop, QueueOptimizer, QueueOptimizerConfig,
};
use super::system_collector::SystemCollector;
use super::{system_collector, Severity};
use crate::config::MonitoringConfig;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REQUESTS_ACTIVE: &str = "requests_active";
pub const REQUEST_DURATION: &str = "request_duration";
pub const REQUESTS_ERRORS: &str = "requests_errors";

pub const DB_POOL_UTILIZATION: &str = "db_pool_utilization";
pub const DB_SLOW_QUERIES: &str = "db_slow_queries";
pub const QUEUE_BACKLOG_TOTAL: &str = "queue_backlog_total";
pub const CACHE_HIT_RATE: &str = "cache_hit_rate";
pub const CACHE_HITS: &str = "cache_hits_total";
pub const CACHE_MISSES: &str = "cache_misses_total";

pub struct MonitoringService {
    config: MonitoringConfig,
    registry: Arc<MetricRegistry>,
    health: Arc<HealthRegistry>,
    alerts: Arc<AlertEngine>,
    optimization: Option<Arc<OptimizationLoop>>,
    system_collector: SystemCollector,
    collectors: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl MonitoringService {
    /// Build and wire the observability core. Must run inside the tokio
    /// runtime: standard rules and collectors spawn their timers here.
    pub fn new(config: MonitoringConfig) -> Arc<Self> {
        let registry = Arc::new(MetricRegistry::new(config.metric_prefix.clone()));
        let health = Arc::new(HealthRegistry::new());
        let alerts = Arc::new(AlertEngine::new(config.max_alert_history));
        alerts.add_notifier(Arc::new(LogNotifier));

        let optimization = config.optimization_enabled.then(|| {
            Arc::new(OptimizationLoop::new(Duration::from_secs(
                config.optimization_interval_secs,
            )))
        });

        let system_collector = SystemCollector::new(
            registry.clone(),
            Duration::from_secs(config.system_collect_interval_secs),
        );

        Self::register_request_metrics(&registry);
        Self::register_adapter_gauges(&registry);

        let service = Arc::new(Self {
            config,
            registry,
            health,
            alerts,
            optimization,
            system_collector,
            collectors: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        });

        service.register_standard_rules();
        service.alerts.add_health_check_rule(&service.health);
        service.health.register_system(
            SystemThresholds::default(),
            CheckOptions {
                critical: false,
                ..Default::default()
            },
        );
        service.system_collector.start();
        service
            .health
            .start(Duration::from_millis(service.config.health_check_interval_ms));

        info!("monitoring service initialized");
        service
    }

    fn register_request_metrics(registry: &MetricRegistry) {
        registry.register(
            REQUESTS_TOTAL,
            MetricKind::Counter,
            "Total HTTP requests handled",
            &["method", "route", "status"],
        );
        registry.register(
            REQUESTS_ACTIVE,
            MetricKind::Gauge,
            "HTTP requests currently in flight",
            &[],
        );
        registry.register(
            REQUEST_DURATION,
            MetricKind::Histogram,
            "HTTP request duration in milliseconds",
            &["method", "route", "status"],
        );
        registry.register(
            REQUESTS_ERRORS,
            MetricKind::Counter,
            "HTTP requests answered with 4xx or 5xx",
            &["method", "route", "status"],
        );
    }

    fn register_adapter_gauges(registry: &MetricRegistry) {
        registry.register(
            DB_POOL_UTILIZATION,
            MetricKind::Gauge,
            "Database connection pool utilization percent",
            &[],
        );
        registry.register(
            DB_SLOW_QUERIES,
            MetricKind::Gauge,
            "Slow queries observed in the last collection",
            &[],
        );
        registry.register(
            QUEUE_BACKLOG_TOTAL,
            MetricKind::Gauge,
            "Jobs waiting or delayed across all queues",
            &[],
        );
        registry.register(
            CACHE_HIT_RATE,
            MetricKind::Gauge,
            "Cache hit rate percent",
            &[],
        );
        registry.register(CACHE_HITS, MetricKind::Gauge, "Cache hits observed", &[]);
        registry.register(CACHE_MISSES, MetricKind::Gauge, "Cache misses observed", &[]);
    }

    fn register_standard_rules(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let no_labels = HashMap::new();

        let r = self.registry.clone();
        let labels = no_labels.clone();
        let _ = self.alerts.add_metric_rule(
            "high_cpu_usage",
            Arc::new(move || r.scalar(system_collector::CPU_USAGE_PERCENT, &labels)),
            Comparison::Gt,
            90.0,
            Severity::Critical,
            "CPU usage above 90%",
            interval,
        );

        let r = self.registry.clone();
        let labels = no_labels.clone();
        let _ = self.alerts.add_metric_rule(
            "high_memory_usage",
            Arc::new(move || r.scalar(system_collector::MEMORY_USED_PERCENT, &labels)),
            Comparison::Gt,
            90.0,
            Severity::Critical,
            "Memory usage above 90%",
            interval,
        );

        let r = self.registry.clone();
        let _ = self.alerts.add_metric_rule(
            "high_error_rate",
            Arc::new(move || {
                let total = r.total(REQUESTS_TOTAL);
                if total == 0.0 {
                    return 0.0;
                }
                r.total(REQUESTS_ERRORS) / total * 100.0
            }),
            Comparison::Gt,
            5.0,
            Severity::Error,
            "Request error rate above 5%",
            interval,
        );

        let r = self.registry.clone();
        let labels = no_labels.clone();
        let _ = self.alerts.add_metric_rule(
            "low_cache_hit_rate",
            // No traffic reads as a full hit rate so the rule stays quiet.
            Arc::new(move || {
                r.get(CACHE_HIT_RATE, &labels)
                    .and_then(|v| v.as_scalar())
                    .unwrap_or(100.0)
            }),
            Comparison::Lt,
            50.0,
            Severity::Warning,
            "Cache hit rate below 50%",
            interval,
        );

        let r = self.registry.clone();
        let labels = no_labels;
        let _ = self.alerts.add_metric_rule(
            "queue_backlog",
            Arc::new(move || r.scalar(QUEUE_BACKLOG_TOTAL, &labels)),
            Comparison::Gt,
            10_000.0,
            Severity::Error,
            "Total queue backlog above 10000 jobs",
            interval,
        );
    }

    fn check_options(&self, critical: bool) -> CheckOptions {
        CheckOptions {
            timeout: Duration::from_millis(self.config.health_check_timeout_ms),
            critical,
            on_unhealthy: None,
        }
    }

    /// Register the database: a health ping, a pool/slow-query collector,
    /// and the database optimizer.
    pub fn register_database(self: &Arc<Self>, adapter: Arc<dyn DatabaseAdapter>) {
        let ping = adapter.clone();
        self.health.register(
            "database",
            Arc::new(move || {
                let ping = ping.clone();
                Box::pin(async move {
                    ping.ping().await?;
                    Ok(None)
                })
            }),
            self.check_options(true),
        );

        let registry = self.registry.clone();
        let collector_adapter = adapter.clone();
        let interval = Duration::from_secs(self.config.system_collect_interval_secs);
        self.spawn_collector("database", interval, move || {
            let registry = registry.clone();
            let adapter = collector_adapter.clone();
            async move {
                let no_labels = HashMap::new();
                match adapter.pool_stats().await {
                    Ok(stats) => registry.record(
                        DB_POOL_UTILIZATION,
                        stats.utilization_percent(),
                        &no_labels,
                    ),
                    Err(e) => warn!("database pool collection failed: {}", e),
                }
                match adapter.slow_queries().await {
                    Ok(slow) => registry.record(DB_SLOW_QUERIES, slow.len() as f64, &no_labels),
                    Err(e) => warn!("slow query collection failed: {}", e),
                }
            }
        });

        if let Some(optimization) = &self.optimization {
            let _ = optimization.register(Arc::new(DatabaseOptimizer::new(
                adapter,
                DatabaseOptimizerConfig::default(),
            )));
        }
    }

    /// Register the key-value store health ping.
    pub fn register_key_value_store(&self, store: Arc<dyn crate::store::KeyValueStore>) {
        self.health.register_kv_store(store, self.check_options(true));
    }

    /// Register the queue system: readiness check, backlog collector, and
    /// the queue optimizer.
    pub fn register_queue_system(self: &Arc<Self>, adapter: Arc<dyn QueueSystemAdapter>) {
        let ready = adapter.clone();
        self.health.register(
            "queue",
            Arc::new(move || {
                let ready = ready.clone();
                Box::pin(async move {
                    ready.ready().await?;
                    Ok(None)
                })
            }),
            self.check_options(true),
        );

        let registry = self.registry.clone();
        let collector_adapter = adapter.clone();
        let interval = Duration::from_secs(self.config.system_collect_interval_secs);
        self.spawn_collector("queue", interval, move || {
            let registry = registry.clone();
            let adapter = collector_adapter.clone();
            async move {
                match adapter.stats().await {
                    Ok(stats) => {
                        let no_labels = HashMap::new();
                        registry.record(
                            QUEUE_BACKLOG_TOTAL,
                            stats.total_backlog as f64,
                            &no_labels,
                        );
                    }
                    Err(e) => warn!("queue stats collection failed: {}", e),
                }
            }
        });

        if let Some(optimization) = &self.optimization {
            let _ = optimization.register(Arc::new(QueueOptimizer::new(
                adapter,
                QueueOptimizerConfig::default(),
            )));
        }
    }

    /// Register the cache service: hit-rate collector and cache optimizer.
    pub fn register_cache_service(self: &Arc<Self>, adapter: Arc<dyn CacheServiceAdapter>) {
        let registry = self.registry.clone();
        let collector_adapter = adapter.clone();
        let interval = Duration::from_secs(self.config.system_collect_interval_secs);
        self.spawn_collector("cache", interval, move || {
            let registry = registry.clone();
            let adapter = collector_adapter.clone();
            async move {
                match adapter.stats().await {
                    Ok(stats) => {
                        let no_labels = HashMap::new();
                        registry.record(CACHE_HIT_RATE, stats.hit_rate_percent(), &no_labels);
                        registry.record(CACHE_HITS, stats.hits as f64, &no_labels);
                        registry.record(CACHE_MISSES, stats.misses as f64, &no_labels);
                    }
                    Err(e) => warn!("cache stats collection failed: {}", e),
                }
            }
        });

        if let Some(optimization) = &self.optimization {
            let _ = optimization.register(Arc::new(CacheOptimizer::new(
                adapter,
                CacheOptimizerConfig::default(),
            )));
        }
    }

    fn spawn_collector<F, Fut>(&self, name: &'static str, interval: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        self.collectors.lock().push(handle);
        info!("started {} collector", name);
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn optimization(&self) -> Option<&Arc<OptimizationLoop>> {
        self.optimization.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop every owned timer: collectors, the system sampler, periodic
    /// health evaluation, rule loops, and the optimization timer.
    pub fn shutdown(&self) {
        for handle in self.collectors.lock().drain(..) {
            handle.abort();
        }
        self.system_collector.stop();
        self.health.stop();
        self.alerts.shutdown();
        if let Some(optimization) = &self.optimization {
            optimization.shutdown();
        }
        info!("monitoring service shut down");
    }
}

/// Axum middleware tracking request counts, in-flight gauge, duration, and
/// error counts per method/route/status.
pub async fn track_requests(
    State(service): State<Arc<MonitoringService>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let registry = service.metrics().clone();
    registry.add_gauge(REQUESTS_ACTIVE, 1.0, &HashMap::new());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let labels: HashMap<String, String> = [
        ("method".to_string(), method),
        ("route".to_string(), route),
        ("status".to_string(), status),
    ]
    .into();

    registry.add_gauge(REQUESTS_ACTIVE, -1.0, &HashMap::new());
    registry.increment_counter(REQUESTS_TOTAL, 1.0, &labels);
    registry.observe_histogram(
        REQUEST_DURATION,
        start.elapsed().as_secs_f64() * 1_000.0,
        &labels,
    );
    if response.status().is_client_error() || response.status().is_server_error() {
        registry.increment_counter(REQUESTS_ERRORS, 1.0, &labels);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::adapters::{PoolStats, QueueSystemStats, SlowQuery};
    use crate::error::Result;
    use async_trait::async_trait;

    struct StubDatabase;

    #[async_trait]
    impl DatabaseAdapter for StubDatabase {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn pool_stats(&self) -> Result<PoolStats> {
            Ok(PoolStats {
                size: 20,
                idle: 5,
                max_size: 50,
            })
        }
        async fn slow_queries(&self) -> Result<Vec<SlowQuery>> {
            Ok(vec![])
        }
        async fn apply_pool_size(&self, _size: u32) -> Result<()> {
            Ok(())
        }
    }

    struct StubQueue;

    #[async_trait]
    impl QueueSystemAdapter for StubQueue {
        async fn ready(&self) -> Result<()> {
            Ok(())
        }
        async fn stats(&self) -> Result<QueueSystemStats> {
            Ok(QueueSystemStats {
                total_backlog: 3,
                backlog_per_queue: HashMap::new(),
                concurrency: 2,
                failed_last_hour: 0,
            })
        }
        async fn apply_concurrency(&self, _concurrency: u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_service_preregisters_request_metrics() {
        let service = MonitoringService::new(MonitoringConfig::default());
        let names: Vec<String> = service
            .metrics()
            .snapshot()
            .into_iter()
            .map(|m| m.name)
            .collect();
        for name in [REQUESTS_TOTAL, REQUESTS_ACTIVE, REQUEST_DURATION, REQUESTS_ERRORS] {
            assert!(names.contains(&name.to_string()), "missing {name}");
        }
        service.shutdown();
    }

    #[tokio::test]
    async fn test_standard_rules_installed() {
        let service = MonitoringService::new(MonitoringConfig::default());
        let rules: Vec<String> = service
            .alerts()
            .rules()
            .into_iter()
            .map(|r| r.name)
            .collect();
        for rule in [
            "high_cpu_usage",
            "high_memory_usage",
            "high_error_rate",
            "low_cache_hit_rate",
            "queue_backlog",
        ] {
            assert!(rules.contains(&rule.to_string()), "missing rule {rule}");
        }
        service.shutdown();
    }

    #[tokio::test]
    async fn test_adapter_registration_adds_health_and_optimizers() {
        let service = MonitoringService::new(MonitoringConfig::default());
        service.register_database(Arc::new(StubDatabase));
        service.register_queue_system(Arc::new(StubQueue));

        // The database and queue probes must both pass; the built-in system
        // check is non-critical, so at worst the aggregate is degraded.
        service.health().check_all().await;
        assert!(service.health().is_available());
        let states = service.health().states();
        assert_eq!(
            states["database"].status,
            crate::monitoring::HealthStatus::Healthy
        );
        assert_eq!(
            states["queue"].status,
            crate::monitoring::HealthStatus::Healthy
        );

        let optimizers = service.optimization().unwrap().optimizer_names();
        assert!(optimizers.contains(&"database".to_string()));
        assert!(optimizers.contains(&"queue".to_string()));
        service.shutdown();
    }

    #[tokio::test]
    async fn test_optimization_can_be_disabled() {
        let config = MonitoringConfig {
            optimization_enabled: false,
            ..Default::default()
        };
        let service = MonitoringService::new(config);
        assert!(service.optimization().is_none());
        service.shutdown();
    }
}
