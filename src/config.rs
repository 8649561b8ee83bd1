use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP port for the admin surface
    pub http_port: u16,

    /// Monitoring configuration
    pub monitoring: MonitoringConfig,

    /// Cache layer configuration
    pub cache: CacheConfig,

    /// Queue layer configuration
    pub queue: QueueConfig,

    /// Disables background sweepers that interfere with deterministic tests
    pub test_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Prefix prepended to every exported metric name
    pub metric_prefix: String,

    /// Interval for the internal system metrics collector, in seconds
    pub system_collect_interval_secs: u64,

    /// Interval for periodic health evaluation, in milliseconds
    pub health_check_interval_ms: u64,

    /// Default per-check timeout, in milliseconds
    pub health_check_timeout_ms: u64,

    /// Maximum number of alerts retained in history
    pub max_alert_history: usize,

    /// Interval for automatic optimization analysis, in seconds
    pub optimization_interval_secs: u64,

    /// Whether the optimization loop is wired at all
    pub optimization_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// First segment of every structured cache key
    pub key_prefix: String,

    /// Last segment of every structured cache key
    pub key_version: String,

    /// Default TTL for cached values, in seconds
    pub default_ttl_secs: u64,

    /// TTL for stampede-protection locks, in seconds
    pub lock_ttl_secs: u64,

    /// Concurrency bound for startup warm-up
    pub warm_concurrency: usize,

    /// Wall-clock budget for startup warm-up, in seconds
    pub warm_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default attempts for enqueued jobs
    pub default_attempts: u32,

    /// Base delay for job retry backoff, in milliseconds
    pub backoff_base_ms: u64,

    /// Per-message processing timeout, in milliseconds
    pub message_timeout_ms: u64,

    /// Retries performed by the message processor before dead-lettering
    pub max_retries: u32,

    /// Base delay between processor retries, in milliseconds
    pub retry_delay_ms: u64,

    /// How long dead-letter records are kept, in seconds
    pub dlq_ttl_secs: u64,

    /// Maximum manual retries per dead-letter record
    pub dlq_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            monitoring: MonitoringConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            test_mode: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "app_".to_string(),
            system_collect_interval_secs: 10,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            max_alert_history: 1_000,
            optimization_interval_secs: 300,
            optimization_enabled: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rdp".to_string(),
            key_version: "v1".to_string(),
            default_ttl_secs: 3_600,
            lock_ttl_secs: 10,
            warm_concurrency: 5,
            warm_timeout_secs: 30,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: 3,
            backoff_base_ms: 1_000,
            message_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            dlq_ttl_secs: 7 * 24 * 3_600,
            dlq_max_retries: 3,
        }
    }
}

impl Config {
    /// Build a config from defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(port) = env_parse::<u16>("OPSCORE_HTTP_PORT") {
            config.http_port = port;
        }
        if let Ok(prefix) = env::var("OPSCORE_METRIC_PREFIX") {
            config.monitoring.metric_prefix = prefix;
        }
        if let Some(secs) = env_parse::<u64>("OPSCORE_SYSTEM_COLLECT_INTERVAL") {
            config.monitoring.system_collect_interval_secs = secs;
        }
        if let Some(ms) = env_parse::<u64>("OPSCORE_HEALTH_INTERVAL_MS") {
            config.monitoring.health_check_interval_ms = ms;
        }
        if let Ok(prefix) = env::var("OPSCORE_CACHE_PREFIX") {
            config.cache.key_prefix = prefix;
        }
        if let Some(secs) = env_parse::<u64>("OPSCORE_CACHE_TTL_SECS") {
            config.cache.default_ttl_secs = secs;
        }
        if let Some(v) = env_parse::<bool>("OPSCORE_TEST_MODE") {
            config.test_mode = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
