//! Health registry: named async checks with per-check timeouts and a
//! tri-state aggregate verdict.
//!
//! Each registered check runs independently; one check failing or hanging
//! never cancels another. A check result is Healthy on `Ok`, Unhealthy on
//! `Err` or timeout. The aggregate is Unhealthy when any critical check is
//! unhealthy, Degraded when only non-critical checks are unhealthy, Healthy
//! otherwise, and Unknown before the first evaluation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Record kept for every registered check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub critical: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub details: Option<Value>,
    pub error: Option<String>,
}

impl HealthState {
    fn unknown(critical: bool) -> Self {
        Self {
            status: HealthStatus::Unknown,
            critical,
            last_check: None,
            last_success: None,
            last_failure: None,
            details: None,
            error: None,
        }
    }
}

/// Event published after each evaluation, consumed by the alert engine.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Check {
        name: String,
        status: HealthStatus,
        critical: bool,
        error: Option<String>,
    },
    Overall {
        status: HealthStatus,
    },
}

pub type CheckFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;
pub type CheckFn = Arc<dyn Fn() -> CheckFuture + Send + Sync>;
pub type UnhealthyCallback = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct CheckOptions {
    pub timeout: Duration,
    pub critical: bool,
    pub on_unhealthy: Option<UnhealthyCallback>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            critical: true,
            on_unhealthy: None,
        }
    }
}

#[derive(Clone)]
struct CheckEntry {
    check: CheckFn,
    options: CheckOptions,
}

/// Thresholds for the built-in system resource check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemThresholds {
    pub max_memory_percent: f64,
    pub max_load_percent: f64,
}

impl Default for SystemThresholds {
    fn default() -> Self {
        Self {
            max_memory_percent: 90.0,
            max_load_percent: 90.0,
        }
    }
}

pub struct HealthRegistry {
    checks: RwLock<HashMap<String, CheckEntry>>,
    states: RwLock<HashMap<String, HealthState>>,
    overall: RwLock<HealthStatus>,
    events: broadcast::Sender<HealthEvent>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            checks: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            overall: RwLock::new(HealthStatus::Unknown),
            events,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Register a named check; the record starts as Unknown.
    pub fn register(&self, name: &str, check: CheckFn, options: CheckOptions) {
        let critical = options.critical;
        self.checks
            .write()
            .insert(name.to_string(), CheckEntry { check, options });
        self.states
            .write()
            .insert(name.to_string(), HealthState::unknown(critical));
        debug!("registered health check {}", name);
    }

    /// Key-value store ping: a set/get/delete roundtrip on a reserved key.
    pub fn register_kv_store(&self, store: Arc<dyn KeyValueStore>, options: CheckOptions) {
        let check: CheckFn = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .set("health:ping", "pong", Some(Duration::from_secs(10)))
                    .await?;
                let value = store.get("health:ping").await?;
                Ok(Some(serde_json::json!({ "roundtrip": value.is_some() })))
            })
        });
        self.register("kv_store", check, options);
    }

    /// Generic HTTP probe: 2xx is healthy, anything else is not.
    pub fn register_http_probe(
        &self,
        name: &str,
        url: &str,
        client: reqwest::Client,
        options: CheckOptions,
    ) {
        let url = url.to_string();
        let check: CheckFn = Arc::new(move || {
            let client = client.clone();
            let url = url.clone();
            Box::pin(async move {
                let response = client.get(&url).send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(Some(serde_json::json!({ "status": status.as_u16() })))
                } else {
                    Err(crate::error::OpsError::Transient(format!(
                        "probe returned {status}"
                    )))
                }
            })
        });
        self.register(name, check, options);
    }

    /// System resource check comparing memory usage and normalized load
    /// against thresholds.
    pub fn register_system(&self, thresholds: SystemThresholds, options: CheckOptions) {
        let check: CheckFn = Arc::new(move || {
            let thresholds = thresholds.clone();
            Box::pin(async move {
                let mut sys = System::new();
                sys.refresh_memory();
                let total = sys.total_memory() as f64;
                let available = sys.available_memory() as f64;
                let memory_percent = if total > 0.0 {
                    (total - available) / total * 100.0
                } else {
                    0.0
                };
                let cpus = num_cpus().max(1) as f64;
                let load_percent = System::load_average().one / cpus * 100.0;

                let details = serde_json::json!({
                    "memory_percent": memory_percent,
                    "load_percent": load_percent,
                });
                if memory_percent > thresholds.max_memory_percent {
                    return Err(crate::error::OpsError::Transient(format!(
                        "memory usage {memory_percent:.1}% above {:.1}%",
                        thresholds.max_memory_percent
                    )));
                }
                if load_percent > thresholds.max_load_percent {
                    return Err(crate::error::OpsError::Transient(format!(
                        "load {load_percent:.1}% above {:.1}%",
                        thresholds.max_load_percent
                    )));
                }
                Ok(Some(details))
            })
        });
        self.register("system", check, options);
    }

    /// Run every registered check once and recompute the aggregate.
    pub async fn check_all(&self) -> HealthStatus {
        let entries: Vec<(String, CheckEntry)> = self
            .checks
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let runs = entries.into_iter().map(|(name, entry)| async move {
            let outcome =
                match tokio::time::timeout(entry.options.timeout, (entry.check)()).await {
                    Ok(Ok(details)) => Ok(details),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "health check timeout after {}ms",
                        entry.options.timeout.as_millis()
                    )),
                };
            (name, entry.options, outcome)
        });

        let results = join_all(runs).await;
        let now = Utc::now();

        for (name, options, outcome) in results {
            let (status, details, error) = match outcome {
                Ok(details) => (HealthStatus::Healthy, details, None),
                Err(message) => (HealthStatus::Unhealthy, None, Some(message)),
            };

            {
                let mut states = self.states.write();
                let state = states
                    .entry(name.clone())
                    .or_insert_with(|| HealthState::unknown(options.critical));
                state.status = status;
                state.last_check = Some(now);
                state.details = details;
                state.error = error.clone();
                match status {
                    HealthStatus::Healthy => state.last_success = Some(now),
                    _ => state.last_failure = Some(now),
                }
            }

            if status == HealthStatus::Unhealthy {
                warn!(
                    "health check {} unhealthy: {}",
                    name,
                    error.as_deref().unwrap_or("unknown")
                );
                if let Some(callback) = &options.on_unhealthy {
                    if let Err(e) = callback(&name, error.as_deref().unwrap_or("")) {
                        error!("on_unhealthy callback for {} failed: {}", name, e);
                    }
                }
            }

            let _ = self.events.send(HealthEvent::Check {
                name,
                status,
                critical: options.critical,
                error,
            });
        }

        let overall = self.recompute_overall();
        let _ = self.events.send(HealthEvent::Overall { status: overall });
        overall
    }

    fn recompute_overall(&self) -> HealthStatus {
        let states = self.states.read();
        let mut any_ran = false;
        let mut critical_unhealthy = false;
        let mut noncritical_unhealthy = false;
        let mut degraded = false;

        for state in states.values() {
            if state.last_check.is_some() {
                any_ran = true;
            }
            match state.status {
                HealthStatus::Unhealthy if state.critical => critical_unhealthy = true,
                HealthStatus::Unhealthy => noncritical_unhealthy = true,
                HealthStatus::Degraded => degraded = true,
                _ => {}
            }
        }

        let overall = if !any_ran {
            HealthStatus::Unknown
        } else if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if noncritical_unhealthy || degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        *self.overall.write() = overall;
        overall
    }

    pub fn overall(&self) -> HealthStatus {
        *self.overall.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.overall() == HealthStatus::Healthy
    }

    /// Available means the service can still take traffic, possibly degraded.
    pub fn is_available(&self) -> bool {
        !matches!(self.overall(), HealthStatus::Unhealthy)
    }

    pub fn states(&self) -> HashMap<String, HealthState> {
        self.states.read().clone()
    }

    /// Start periodic evaluation: one immediate run, then every `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting health registry at {:?} interval", interval);

        let registry = self.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                registry.check_all().await;
                tokio::time::sleep(interval).await;
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
