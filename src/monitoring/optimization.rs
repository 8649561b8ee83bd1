//! Feedback-driven performance optimization.
//!
//! A single-flight state machine walks Idle → Analyzing → Optimizing →
//! Verifying → Idle across pluggable optimizers. Analysis snapshots become
//! the benchmark that optimization and verification are measured against.
//! One optimizer failing never stops its siblings; errors are recorded in
//! the history entry instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapters::{CacheServiceAdapter, DatabaseAdapter, QueueSystemAdapter};
use crate::error::{OpsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationState {
    Idle,
    Analyzing,
    Optimizing,
    Verifying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub optimizable: bool,
    pub metrics: HashMap<String, f64>,
    pub evidence: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationAction {
    pub kind: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimization {
    pub actions: Vec<OptimizationAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub before: HashMap<String, f64>,
    pub after: HashMap<String, f64>,
    /// Signed percent improvement per metric, positive is better.
    pub improvements: HashMap<String, f64>,
    pub overall_improvement: f64,
    pub success: bool,
    pub error: Option<String>,
}

/// The most recent analysis snapshot, used as the baseline for optimization
/// and verification.
#[derive(Debug, Clone, Serialize)]
pub struct Benchmark {
    pub timestamp: DateTime<Utc>,
    pub analyses: HashMap<String, Analysis>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OptimizerOutcome {
    pub optimization: Option<Optimization>,
    pub verification: Option<Verification>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcomes: HashMap<String, OptimizerOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub timestamp: DateTime<Utc>,
    pub analyses: HashMap<String, Analysis>,
    /// Optimizers whose analysis found something to improve.
    pub to_run: Vec<String>,
}

#[async_trait]
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    async fn is_applicable(&self) -> bool;

    async fn analyze(&self) -> Result<Analysis>;

    async fn optimize(&self, analysis: &Analysis) -> Result<Optimization>;

    /// How long to let the system settle before re-analyzing.
    fn settle_delay(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Weight per metric for the overall improvement; unlisted metrics
    /// weigh 1.0.
    fn metric_weights(&self) -> HashMap<String, f64> {
        HashMap::new()
    }

    /// Whether a larger value of the metric is the better direction.
    fn higher_is_better(&self, metric: &str) -> bool {
        let _ = metric;
        false
    }
}

pub struct OptimizationLoop {
    optimizers: Mutex<Vec<Arc<dyn Optimizer>>>,
    state: Mutex<OptimizationState>,
    benchmark: Mutex<Option<Benchmark>>,
    history: Mutex<Vec<OptimizationRecord>>,
    automatic: AtomicBool,
    interval: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Shrinks settle delays in tests so verification stays fast.
    settle_scale: f64,
}

impl OptimizationLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            optimizers: Mutex::new(Vec::new()),
            state: Mutex::new(OptimizationState::Idle),
            benchmark: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            automatic: AtomicBool::new(false),
            interval,
            timer: Mutex::new(None),
            settle_scale: 1.0,
        }
    }

    #[cfg(test)]
    fn with_settle_scale(mut self, scale: f64) -> Self {
        self.settle_scale = scale;
        self
    }

    /// Register an optimizer. Descriptors are validated eagerly: empty or
    /// duplicate names are configuration errors.
    pub fn register(&self, optimizer: Arc<dyn Optimizer>) -> Result<()> {
        if optimizer.name().is_empty() {
            return Err(OpsError::Config("optimizer name must not be empty".into()));
        }
        let mut optimizers = self.optimizers.lock();
        if optimizers.iter().any(|o| o.name() == optimizer.name()) {
            return Err(OpsError::Config(format!(
                "optimizer {} already registered",
                optimizer.name()
            )));
        }
        info!("registered optimizer {}", optimizer.name());
        optimizers.push(optimizer);
        Ok(())
    }

    pub fn state(&self) -> OptimizationState {
        *self.state.lock()
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic.load(Ordering::SeqCst)
    }

    pub fn optimizer_names(&self) -> Vec<String> {
        self.optimizers
            .lock()
            .iter()
            .map(|o| o.name().to_string())
            .collect()
    }

    pub fn benchmark(&self) -> Option<Benchmark> {
        self.benchmark.lock().clone()
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<OptimizationRecord> {
        let history = self.history.lock();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    fn transition(&self, from: OptimizationState, to: OptimizationState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(OpsError::Validation(format!(
                "optimization loop is {:?}, expected {:?}",
                *state, from
            )));
        }
        *state = to;
        Ok(())
    }

    fn force_idle(&self) {
        *self.state.lock() = OptimizationState::Idle;
    }

    /// Run the analysis phase. In automatic mode a non-empty result
    /// continues straight into optimize + verify.
    pub async fn run_analysis(self: &Arc<Self>) -> Result<AnalysisOutcome> {
        self.transition(OptimizationState::Idle, OptimizationState::Analyzing)?;

        let optimizers: Vec<Arc<dyn Optimizer>> = self.optimizers.lock().clone();
        let mut analyses = HashMap::new();

        for optimizer in &optimizers {
            if !optimizer.is_applicable().await {
                debug!("optimizer {} not applicable, skipping", optimizer.name());
                continue;
            }
            match optimizer.analyze().await {
                Ok(analysis) => {
                    analyses.insert(optimizer.name().to_string(), analysis);
                }
                Err(e) => {
                    warn!("optimizer {} analysis failed: {}", optimizer.name(), e);
                }
            }
        }

        let timestamp = Utc::now();
        let to_run: Vec<String> = analyses
            .iter()
            .filter(|(_, a)| a.optimizable)
            .map(|(name, _)| name.clone())
            .collect();

        *self.benchmark.lock() = Some(Benchmark {
            timestamp,
            analyses: analyses.clone(),
        });

        let outcome = AnalysisOutcome {
            timestamp,
            analyses,
            to_run: to_run.clone(),
        };

        if self.is_automatic() && !to_run.is_empty() {
            // Internally driven continuation; the only transition allowed
            // out of Analyzing besides returning to Idle.
            self.transition(OptimizationState::Analyzing, OptimizationState::Optimizing)?;
            self.optimize_and_verify(&to_run).await;
        } else {
            self.force_idle();
        }

        Ok(outcome)
    }

    /// Run the optimize + verify phases for the named optimizers against the
    /// most recent benchmark.
    pub async fn run_optimization(self: &Arc<Self>, names: &[String]) -> Result<OptimizationRecord> {
        if self.benchmark.lock().is_none() {
            return Err(OpsError::Validation(
                "no analysis benchmark available, run analysis first".into(),
            ));
        }
        self.transition(OptimizationState::Idle, OptimizationState::Optimizing)?;
        Ok(self.optimize_and_verify(names).await)
    }

    async fn optimize_and_verify(self: &Arc<Self>, names: &[String]) -> OptimizationRecord {
        let benchmark = self
            .benchmark
            .lock()
            .clone()
            .expect("benchmark checked before entering Optimizing");
        let optimizers: Vec<Arc<dyn Optimizer>> = self.optimizers.lock().clone();

        let mut outcomes: HashMap<String, OptimizerOutcome> = HashMap::new();

        for name in names {
            let Some(optimizer) = optimizers.iter().find(|o| o.name() == name) else {
                outcomes.insert(
                    name.clone(),
                    OptimizerOutcome {
                        error: Some(format!("unknown optimizer {name}")),
                        ..Default::default()
                    },
                );
                continue;
            };
            let Some(analysis) = benchmark.analyses.get(name) else {
                outcomes.insert(
                    name.clone(),
                    OptimizerOutcome {
                        error: Some(format!("no analysis for {name} in current benchmark")),
                        ..Default::default()
                    },
                );
                continue;
            };

            match optimizer.optimize(analysis).await {
                Ok(optimization) => {
                    info!(
                        "optimizer {} applied {} action(s)",
                        name,
                        optimization.actions.len()
                    );
                    outcomes.insert(
                        name.clone(),
                        OptimizerOutcome {
                            optimization: Some(optimization),
                            ..Default::default()
                        },
                    );
                }
                Err(e) => {
                    warn!("optimizer {} failed: {}", name, e);
                    outcomes.insert(
                        name.clone(),
                        OptimizerOutcome {
                            error: Some(e.to_string()),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let mut record = OptimizationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            outcomes,
        };
        self.history.lock().push(record.clone());

        // Verification phase: settle, re-analyze, diff against the
        // benchmark. A verification failure only marks its own entry.
        if self
            .transition(OptimizationState::Optimizing, OptimizationState::Verifying)
            .is_ok()
        {
            for name in names {
                let Some(optimizer) = optimizers.iter().find(|o| o.name() == name) else {
                    continue;
                };
                let Some(before) = benchmark.analyses.get(name).map(|a| a.metrics.clone()) else {
                    continue;
                };
                if record
                    .outcomes
                    .get(name)
                    .is_none_or(|o| o.optimization.is_none())
                {
                    continue;
                }

                let settle = self.scaled_settle(optimizer.settle_delay());
                tokio::time::sleep(settle).await;

                let verification = match optimizer.analyze().await {
                    Ok(re_analysis) => {
                        compute_verification(optimizer.as_ref(), &before, &re_analysis.metrics)
                    }
                    Err(e) => Verification {
                        before,
                        after: HashMap::new(),
                        improvements: HashMap::new(),
                        overall_improvement: 0.0,
                        success: false,
                        error: Some(e.to_string()),
                    },
                };

                if let Some(outcome) = record.outcomes.get_mut(name) {
                    outcome.verification = Some(verification);
                }
            }

            // Re-attach verifications to the stored history entry.
            let mut history = self.history.lock();
            if let Some(entry) = history.iter_mut().find(|r| r.id == record.id) {
                *entry = record.clone();
            }
        }

        self.force_idle();
        record
    }

    fn scaled_settle(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(delay.as_secs_f64() * self.settle_scale)
    }

    /// Turn on automatic mode and start the periodic analysis timer.
    pub fn enable_automatic(self: &Arc<Self>) {
        if self.automatic.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("automatic optimization enabled ({:?} interval)", self.interval);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.interval).await;
                if !this.is_automatic() {
                    break;
                }
                if let Err(e) = this.run_analysis().await {
                    debug!("automatic analysis skipped: {}", e);
                }
            }
        });
        *self.timer.lock() = Some(handle);
    }

    pub fn disable_automatic(&self) {
        self.automatic.store(false, Ordering::SeqCst);
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        info!("automatic optimization disabled");
    }

    pub fn shutdown(&self) {
        self.disable_automatic();
    }
}

fn compute_verification(
    optimizer: &dyn Optimizer,
    before: &HashMap<String, f64>,
    after: &HashMap<String, f64>,
) -> Verification {
    let weights = optimizer.metric_weights();
    let mut improvements = HashMap::new();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    for (metric, before_value) in before {
        let Some(after_value) = after.get(metric) else {
            continue;
        };
        let improvement = if *before_value == 0.0 {
            0.0
        } else if optimizer.higher_is_better(metric) {
            (after_value - before_value) / before_value * 100.0
        } else {
            (before_value - after_value) / before_value * 100.0
        };
        let weight = weights.get(metric).copied().unwrap_or(1.0);
        weighted_sum += improvement * weight;
        weight_total += weight;
        improvements.insert(metric.clone(), improvement);
    }

    let overall_improvement = if weight_total == 0.0 {
        0.0
    } else {
        weighted_sum / weight_total
    };

    Verification {
        before: before.clone(),
        after: after.clone(),
        improvements,
        overall_improvement,
        success: overall_improvement > 0.0,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Concrete optimizers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseOptimizerConfig {
    /// Pool utilization percent above which resizing kicks in
    pub max_pool_utilization: f64,
    /// Queries slower than this count as slow
    pub slow_query_threshold_ms: f64,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

impl Default for DatabaseOptimizerConfig {
    fn default() -> Self {
        Self {
            max_pool_utilization: 80.0,
            slow_query_threshold_ms: 100.0,
            min_pool_size: 10,
            max_pool_size: 100,
        }
    }
}

pub struct DatabaseOptimizer {
    adapter: Arc<dyn DatabaseAdapter>,
    config: DatabaseOptimizerConfig,
}

impl DatabaseOptimizer {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, config: DatabaseOptimizerConfig) -> Self {
        Self { adapter, config }
    }
}

#[async_trait]
impl Optimizer for DatabaseOptimizer {
    fn name(&self) -> &str {
        "database"
    }

    async fn is_applicable(&self) -> bool {
        self.adapter.ping().await.is_ok()
    }

    async fn analyze(&self) -> Result<Analysis> {
        let pool = self.adapter.pool_stats().await?;
        let slow = self.adapter.slow_queries().await?;
        let slow: Vec<_> = slow
            .into_iter()
            .filter(|q| q.mean_time_ms > self.config.slow_query_threshold_ms)
            .collect();

        let utilization = pool.utilization_percent();
        let mean_slow_ms = if slow.is_empty() {
            0.0
        } else {
            slow.iter().map(|q| q.mean_time_ms).sum::<f64>() / slow.len() as f64
        };

        let mut metrics = HashMap::new();
        metrics.insert("pool_utilization".to_string(), utilization);
        metrics.insert("slow_query_count".to_string(), slow.len() as f64);
        metrics.insert("mean_slow_query_ms".to_string(), mean_slow_ms);

        Ok(Analysis {
            optimizable: utilization > self.config.max_pool_utilization || !slow.is_empty(),
            metrics,
            evidence: serde_json::json!({
                "pool": pool,
                "slow_queries": slow,
            }),
        })
    }

    async fn optimize(&self, analysis: &Analysis) -> Result<Optimization> {
        let mut actions = Vec::new();

        let utilization = analysis
            .metrics
            .get("pool_utilization")
            .copied()
            .unwrap_or(0.0);
        if utilization > self.config.max_pool_utilization {
            let pool = self.adapter.pool_stats().await?;
            let active = pool.size.saturating_sub(pool.idle);
            let target = ((active as f64 * 1.5) as u32)
                .clamp(self.config.min_pool_size, self.config.max_pool_size);
            self.adapter.apply_pool_size(target).await?;
            actions.push(OptimizationAction {
                kind: "resize_pool".to_string(),
                description: format!("resized connection pool to {target}"),
                parameters: serde_json::json!({ "size": target }),
            });
        }

        let slow_count = analysis
            .metrics
            .get("slow_query_count")
            .copied()
            .unwrap_or(0.0);
        if slow_count > 0.0 {
            actions.push(OptimizationAction {
                kind: "index_recommendation".to_string(),
                description: format!(
                    "{slow_count} slow queries found, review indexes on their filter columns"
                ),
                parameters: analysis.evidence.clone(),
            });
        }

        Ok(Optimization { actions })
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptimizerConfig {
    /// Hit rate percent below which the cache is worth tuning
    pub min_hit_rate: f64,
    /// Minimum traffic before the hit rate is meaningful
    pub min_requests: u64,
    /// Ceiling for TTL doubling, in seconds
    pub max_ttl_secs: u64,
}

impl Default for CacheOptimizerConfig {
    fn default() -> Self {
        Self {
            min_hit_rate: 50.0,
            min_requests: 100,
            max_ttl_secs: 86_400,
        }
    }
}

pub struct CacheOptimizer {
    adapter: Arc<dyn CacheServiceAdapter>,
    config: CacheOptimizerConfig,
}

impl CacheOptimizer {
    pub fn new(adapter: Arc<dyn CacheServiceAdapter>, config: CacheOptimizerConfig) -> Self {
        Self { adapter, config }
    }
}

#[async_trait]
impl Optimizer for CacheOptimizer {
    fn name(&self) -> &str {
        "cache"
    }

    async fn is_applicable(&self) -> bool {
        self.adapter.stats().await.is_ok()
    }

    async fn analyze(&self) -> Result<Analysis> {
        let stats = self.adapter.stats().await?;
        let total = stats.hits + stats.misses;
        let hit_rate = stats.hit_rate_percent();

        let mut metrics = HashMap::new();
        metrics.insert("hit_rate".to_string(), hit_rate);
        metrics.insert("miss_count".to_string(), stats.misses as f64);

        Ok(Analysis {
            optimizable: total >= self.config.min_requests && hit_rate < self.config.min_hit_rate,
            metrics,
            evidence: serde_json::json!({ "stats": stats }),
        })
    }

    async fn optimize(&self, _analysis: &Analysis) -> Result<Optimization> {
        let stats = self.adapter.stats().await?;
        let mut actions = Vec::new();

        let target_ttl = (stats.default_ttl_secs * 2).min(self.config.max_ttl_secs);
        if target_ttl != stats.default_ttl_secs {
            self.adapter.apply_ttl(target_ttl).await?;
            actions.push(OptimizationAction {
                kind: "extend_ttl".to_string(),
                description: format!("raised default TTL to {target_ttl}s"),
                parameters: serde_json::json!({ "ttl_secs": target_ttl }),
            });
        }

        self.adapter.prewarm().await?;
        actions.push(OptimizationAction {
            kind: "prewarm".to_string(),
            description: "re-warmed core cache keys".to_string(),
            parameters: serde_json::json!({}),
        });

        Ok(Optimization { actions })
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn metric_weights(&self) -> HashMap<String, f64> {
        // The hit rate is what this optimizer is for; miss volume is a
        // secondary signal.
        HashMap::from([("hit_rate".to_string(), 3.0), ("miss_count".to_string(), 1.0)])
    }

    fn higher_is_better(&self, metric: &str) -> bool {
        metric == "hit_rate"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptimizerConfig {
    /// Backlog size above which the consumer is scaled up
    pub max_backlog: u64,
    pub concurrency_step: u32,
    pub max_concurrency: u32,
}

impl Default for QueueOptimizerConfig {
    fn default() -> Self {
        Self {
            max_backlog: 1_000,
            concurrency_step: 2,
            max_concurrency: 32,
        }
    }
}

pub struct QueueOptimizer {
    adapter: Arc<dyn QueueSystemAdapter>,
    config: QueueOptimizerConfig,
}

impl QueueOptimizer {
    pub fn new(adapter: Arc<dyn QueueSystemAdapter>, config: QueueOptimizerConfig) -> Self {
        Self { adapter, config }
    }
}

#[async_trait]
impl Optimizer for QueueOptimizer {
    fn name(&self) -> &str {
        "queue"
    }

    async fn is_applicable(&self) -> bool {
        self.adapter.ready().await.is_ok()
    }

    async fn analyze(&self) -> Result<Analysis> {
        let stats = self.adapter.stats().await?;

        let mut metrics = HashMap::new();
        metrics.insert("total_backlog".to_string(), stats.total_backlog as f64);
        metrics.insert("concurrency".to_string(), stats.concurrency as f64);
        metrics.insert("failed_last_hour".to_string(), stats.failed_last_hour as f64);

        Ok(Analysis {
            optimizable: stats.total_backlog > self.config.max_backlog,
            metrics,
            evidence: serde_json::json!({ "stats": stats }),
        })
    }

    async fn optimize(&self, analysis: &Analysis) -> Result<Optimization> {
        let current = analysis.metrics.get("concurrency").copied().unwrap_or(1.0) as u32;
        let target = (current + self.config.concurrency_step).min(self.config.max_concurrency);

        let mut actions = Vec::new();
        if target != current {
            self.adapter.apply_concurrency(target).await?;
            actions.push(OptimizationAction {
                kind: "scale_consumers".to_string(),
                description: format!("raised consumer concurrency from {current} to {target}"),
                parameters: serde_json::json!({ "concurrency": target }),
            });
        } else {
            actions.push(OptimizationAction {
                kind: "batch_recommendation".to_string(),
                description: "consumer concurrency at ceiling, consider batching producers"
                    .to_string(),
                parameters: serde_json::json!({ "concurrency": current }),
            });
        }

        Ok(Optimization { actions })
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn metric_weights(&self) -> HashMap<String, f64> {
        HashMap::from([("total_backlog".to_string(), 2.0)])
    }
}
