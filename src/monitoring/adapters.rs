//! Adapter traits for the downstream systems the façade observes and the
//! optimization loop tunes.
//!
//! Explicit trait objects are passed in at registration time; nothing here is
//! a process-wide singleton. Read methods feed health checks and metric
//! collectors, `apply_*` methods are the controls optimizers write into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max_size: u32,
}

impl PoolStats {
    pub fn utilization_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        (self.size.saturating_sub(self.idle)) as f64 / self.max_size as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQuery {
    pub query: String,
    pub calls: u64,
    pub mean_time_ms: f64,
}

#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn pool_stats(&self) -> Result<PoolStats>;

    async fn slow_queries(&self) -> Result<Vec<SlowQuery>>;

    async fn apply_pool_size(&self, size: u32) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSystemStats {
    pub total_backlog: u64,
    pub backlog_per_queue: HashMap<String, u64>,
    pub concurrency: u32,
    pub failed_last_hour: u64,
}

#[async_trait]
pub trait QueueSystemAdapter: Send + Sync {
    async fn ready(&self) -> Result<()>;

    async fn stats(&self) -> Result<QueueSystemStats>;

    async fn apply_concurrency(&self, concurrency: u32) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheServiceStats {
    pub hits: u64,
    pub misses: u64,
    pub default_ttl_secs: u64,
}

impl CacheServiceStats {
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 100.0;
        }
        self.hits as f64 / total as f64 * 100.0
    }
}

#[async_trait]
pub trait CacheServiceAdapter: Send + Sync {
    async fn stats(&self) -> Result<CacheServiceStats>;

    async fn apply_ttl(&self, ttl_secs: u64) -> Result<()>;

    /// Re-run warm-up for the core key set.
    async fn prewarm(&self) -> Result<()>;
}
