//! Alert engine: rule evaluation, active-alert tracking, silences,
//! acknowledgements, bounded history, and notifier fan-out.
//!
//! All state transitions for a given alert name go through one async mutex,
//! so raise/resolve/acknowledge/silence never interleave partially. Each
//! enabled rule owns its own evaluation loop; a tick runs the condition to
//! completion before the next tick is scheduled, so a slow condition can
//! never overlap itself.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{HealthEvent, HealthRegistry, HealthStatus};
use super::notify::Notifier;
use super::Severity;
use crate::error::{OpsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Silenced,
    Resolved,
}

/// One delivery attempt against a notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub notifier: String,
    pub time: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique per raise: `<name>:<created-millis>`.
    pub id: String,
    /// Active-alert identity; at most one active alert exists per name.
    pub name: String,
    pub message: String,
    pub severity: Severity,
    pub labels: Vec<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_message: Option<String>,
    pub silenced_by: Option<String>,
    pub data: Option<Value>,
    pub deliveries: Vec<DeliveryRecord>,
}

impl Alert {
    pub fn new(
        name: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        labels: Vec<String>,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: format!("{}:{}", name, now.timestamp_millis()),
            name,
            message: message.into(),
            severity,
            labels,
            status: AlertStatus::Active,
            created_at: now,
            last_updated: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolution_message: None,
            silenced_by: None,
            data: None,
            deliveries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Silence {
    pub id: String,
    /// Alert name to match, or `"*"` for any.
    pub name: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// None means permanent.
    pub expires_at: Option<DateTime<Utc>>,
    pub silenced_by: String,
    pub reason: Option<String>,
}

impl Silence {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Name matches exactly or via wildcard, and every silence label must
    /// appear in the alert's labels.
    fn matches(&self, name: &str, labels: &[String]) -> bool {
        (self.name == "*" || self.name == name)
            && self.labels.iter().all(|l| labels.contains(l))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Ne => value != threshold,
        }
    }
}

/// Result of a rule condition evaluation.
#[derive(Debug, Clone, Default)]
pub struct ConditionOutcome {
    pub triggered: bool,
    pub data: Option<Value>,
}

impl From<bool> for ConditionOutcome {
    fn from(triggered: bool) -> Self {
        Self {
            triggered,
            data: None,
        }
    }
}

pub type ConditionFuture = Pin<Box<dyn Future<Output = Result<ConditionOutcome>> + Send>>;
pub type ConditionFn = Arc<dyn Fn() -> ConditionFuture + Send + Sync>;

pub struct AlertRule {
    pub name: String,
    pub condition: ConditionFn,
    pub message: String,
    pub severity: Severity,
    pub labels: Vec<String>,
    pub check_interval: Duration,
    pub auto_resolve_after: Option<Duration>,
    pub enabled: bool,
}

#[derive(Default)]
struct EngineState {
    active: HashMap<String, Alert>,
    // Newest first, bounded by max_history.
    history: VecDeque<Alert>,
    silences: HashMap<String, Silence>,
}

impl EngineState {
    fn push_history(&mut self, alert: &Alert, max_history: usize) {
        self.history.push_front(alert.clone());
        self.history.truncate(max_history);
    }

    fn update_history(&mut self, alert: &Alert) {
        if let Some(entry) = self.history.iter_mut().find(|a| a.id == alert.id) {
            *entry = alert.clone();
        }
    }

    fn prune_expired_silences(&mut self) {
        let now = Utc::now();
        self.silences.retain(|_, s| !s.is_expired(now));
    }

    fn matching_silence(&mut self, name: &str, labels: &[String]) -> Option<String> {
        self.prune_expired_silences();
        self.silences
            .values()
            .find(|s| s.matches(name, labels))
            .map(|s| s.id.clone())
    }
}

pub struct AlertEngine {
    state: Mutex<EngineState>,
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    max_history: usize,
    rule_meta: RwLock<HashMap<String, RuleMeta>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleMeta {
    pub name: String,
    pub severity: Severity,
    pub check_interval_ms: u64,
    pub enabled: bool,
}

impl AlertEngine {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            notifiers: RwLock::new(Vec::new()),
            max_history,
            rule_meta: RwLock::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Raise an alert unless a silence matches. Returns the alert when it
    /// was actually raised.
    pub async fn raise(
        &self,
        name: &str,
        message: &str,
        severity: Severity,
        labels: Vec<String>,
    ) -> Option<Alert> {
        self.raise_with_data(name, message, severity, labels, None)
            .await
    }

    pub async fn raise_with_data(
        &self,
        name: &str,
        message: &str,
        severity: Severity,
        labels: Vec<String>,
        data: Option<Value>,
    ) -> Option<Alert> {
        let mut state = self.state.lock().await;

        if let Some(silence_id) = state.matching_silence(name, &labels) {
            debug!("alert {} suppressed by silence {}", name, silence_id);
            return None;
        }

        let mut alert = Alert::new(name, message, severity, labels);
        alert.data = data;

        // Fan out while still holding the monitor so transitions for this
        // name stay serialized. Sinks run sequentially, failures contained.
        let notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.read().clone();
        for notifier in notifiers {
            if !notifier.filter(&alert) {
                continue;
            }
            let record = match notifier.notify(&alert).await {
                Ok(()) => DeliveryRecord {
                    notifier: notifier.name().to_string(),
                    time: Utc::now(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    warn!("notifier {} failed for {}: {}", notifier.name(), name, e);
                    DeliveryRecord {
                        notifier: notifier.name().to_string(),
                        time: Utc::now(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            alert.deliveries.push(record);
        }

        state.active.insert(alert.name.clone(), alert.clone());
        state.push_history(&alert, self.max_history);
        info!("raised alert {} ({})", alert.name, alert.severity.as_str());
        Some(alert)
    }

    pub async fn resolve(&self, name: &str, message: Option<&str>) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut alert) = state.active.remove(name) else {
            return false;
        };
        let now = Utc::now();
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.last_updated = now;
        alert.resolution_message = message.map(|m| m.to_string());
        state.update_history(&alert);
        info!("resolved alert {}", name);
        true
    }

    pub async fn acknowledge(&self, name: &str, by: &str, message: Option<&str>) -> bool {
        let mut state = self.state.lock().await;
        let Some(alert) = state.active.get_mut(name) else {
            return false;
        };
        let now = Utc::now();
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.acknowledged_by = Some(by.to_string());
        alert.last_updated = now;
        if let Some(message) = message {
            alert.data = Some(serde_json::json!({ "ack_message": message }));
        }
        let snapshot = alert.clone();
        state.update_history(&snapshot);
        true
    }

    /// Install a silence. `duration` of zero means permanent. Any active
    /// alert currently matching flips to Silenced.
    pub async fn silence(
        self: &Arc<Self>,
        name: &str,
        labels: Vec<String>,
        duration: Duration,
        silenced_by: &str,
        reason: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = if duration.is_zero() {
            None
        } else {
            Some(now + chrono::Duration::from_std(duration).unwrap_or_default())
        };
        let silence = Silence {
            id: id.clone(),
            name: name.to_string(),
            labels,
            created_at: now,
            expires_at,
            silenced_by: silenced_by.to_string(),
            reason,
        };

        {
            let mut state = self.state.lock().await;
            for alert in state.active.values_mut() {
                if silence.matches(&alert.name, &alert.labels) {
                    alert.status = AlertStatus::Silenced;
                    alert.silenced_by = Some(id.clone());
                    alert.last_updated = now;
                }
            }
            let updated: Vec<Alert> = state
                .active
                .values()
                .filter(|a| a.silenced_by.as_deref() == Some(id.as_str()))
                .cloned()
                .collect();
            for alert in updated {
                state.update_history(&alert);
            }
            state.silences.insert(id.clone(), silence);
        }

        // Finite silences expire on their own; the task just restores any
        // alerts that were flipped.
        if !duration.is_zero() {
            let engine = self.clone();
            let silence_id = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                engine.unsilence(&silence_id).await;
            });
            self.tasks.lock().push(handle);
        }

        info!("silenced {} for {:?} (id {})", name, duration, id);
        id
    }

    /// Remove a silence and restore any alerts it had flipped.
    pub async fn unsilence(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.silences.remove(id).is_none() {
            return false;
        }
        let now = Utc::now();
        let mut restored = Vec::new();
        for alert in state.active.values_mut() {
            if alert.silenced_by.as_deref() == Some(id) {
                alert.status = AlertStatus::Active;
                alert.silenced_by = None;
                alert.last_updated = now;
                restored.push(alert.clone());
            }
        }
        for alert in restored {
            state.update_history(&alert);
        }
        debug!("removed silence {}", id);
        true
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.state.lock().await.active.contains_key(name)
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.lock().await.active.values().cloned().collect()
    }

    pub async fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        let state = self.state.lock().await;
        let limit = limit.unwrap_or(state.history.len());
        state.history.iter().take(limit).cloned().collect()
    }

    pub async fn silences(&self) -> Vec<Silence> {
        let mut state = self.state.lock().await;
        state.prune_expired_silences();
        state.silences.values().cloned().collect()
    }

    pub fn rules(&self) -> Vec<RuleMeta> {
        self.rule_meta.read().values().cloned().collect()
    }

    /// Install a rule and start its evaluation loop. Registration inputs are
    /// validated eagerly.
    pub fn add_rule(self: &Arc<Self>, rule: AlertRule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(OpsError::Config("alert rule name must not be empty".into()));
        }
        if rule.check_interval.is_zero() {
            return Err(OpsError::Config(format!(
                "alert rule {} must have a non-zero check interval",
                rule.name
            )));
        }
        if self.rule_meta.read().contains_key(&rule.name) {
            return Err(OpsError::Config(format!(
                "alert rule {} already registered",
                rule.name
            )));
        }

        self.rule_meta.write().insert(
            rule.name.clone(),
            RuleMeta {
                name: rule.name.clone(),
                severity: rule.severity,
                check_interval_ms: rule.check_interval.as_millis() as u64,
                enabled: rule.enabled,
            },
        );

        if !rule.enabled {
            return Ok(());
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                engine.evaluate_rule(&rule).await;
                tokio::time::sleep(rule.check_interval).await;
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn evaluate_rule(&self, rule: &AlertRule) {
        let outcome = match (rule.condition)().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("rule {} condition failed: {}", rule.name, e);
                ConditionOutcome::default()
            }
        };

        let (is_active, created_at) = {
            let state = self.state.lock().await;
            match state.active.get(&rule.name) {
                Some(alert) => (true, Some(alert.created_at)),
                None => (false, None),
            }
        };

        if outcome.triggered {
            if is_active {
                // Auto-resolve overrides a still-truthy condition once the
                // deadline passes.
                if let (Some(after), Some(created)) = (rule.auto_resolve_after, created_at) {
                    let elapsed = Utc::now().signed_duration_since(created);
                    if elapsed.to_std().unwrap_or_default() >= after {
                        self.resolve(&rule.name, Some("Auto-resolved")).await;
                    }
                }
                return;
            }
            // raise re-checks silences under the engine's monitor.
            self.raise_with_data(
                &rule.name,
                &rule.message,
                rule.severity,
                rule.labels.clone(),
                outcome.data,
            )
            .await;
        } else if is_active {
            self.resolve(&rule.name, Some("Condition no longer met")).await;
        }
    }

    /// The common rule shape: compare a metric closure against a threshold.
    #[allow(clippy::too_many_arguments)]
    pub fn add_metric_rule(
        self: &Arc<Self>,
        name: &str,
        metric: Arc<dyn Fn() -> f64 + Send + Sync>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
        message: &str,
        check_interval: Duration,
    ) -> Result<()> {
        let condition: ConditionFn = Arc::new(move || {
            let metric = metric.clone();
            Box::pin(async move {
                let value = metric();
                Ok(ConditionOutcome {
                    triggered: comparison.evaluate(value, threshold),
                    data: Some(serde_json::json!({ "value": value, "threshold": threshold })),
                })
            })
        });
        self.add_rule(AlertRule {
            name: name.to_string(),
            condition,
            message: message.to_string(),
            severity,
            labels: Vec::new(),
            check_interval,
            auto_resolve_after: None,
            enabled: true,
        })
    }

    /// Bridge health events into alerts: one `health_check_<name>` alert per
    /// failing check, plus a composite `system_health` alert for the overall
    /// verdict, auto-resolving on recovery.
    pub fn add_health_check_rule(self: &Arc<Self>, health: &HealthRegistry) {
        let mut events = health.subscribe();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    HealthEvent::Check {
                        name,
                        status,
                        critical,
                        error,
                    } => {
                        let alert_name = format!("health_check_{name}");
                        match status {
                            HealthStatus::Unhealthy => {
                                if !engine.is_active(&alert_name).await {
                                    let severity = if critical {
                                        Severity::Critical
                                    } else {
                                        Severity::Warning
                                    };
                                    let message = format!(
                                        "Health check {} failed: {}",
                                        name,
                                        error.as_deref().unwrap_or("unknown")
                                    );
                                    engine
                                        .raise(&alert_name, &message, severity, vec![name.clone()])
                                        .await;
                                }
                            }
                            HealthStatus::Healthy => {
                                if engine.is_active(&alert_name).await {
                                    engine
                                        .resolve(&alert_name, Some("Health check recovered"))
                                        .await;
                                }
                            }
                            _ => {}
                        }
                    }
                    HealthEvent::Overall { status } => match status {
                        HealthStatus::Degraded | HealthStatus::Unhealthy => {
                            if !engine.is_active("system_health").await {
                                let severity = if status == HealthStatus::Unhealthy {
                                    Severity::Critical
                                } else {
                                    Severity::Warning
                                };
                                engine
                                    .raise(
                                        "system_health",
                                        "Overall system health degraded",
                                        severity,
                                        Vec::new(),
                                    )
                                    .await;
                            }
                        }
                        HealthStatus::Healthy => {
                            if engine.is_active("system_health").await {
                                engine
                                    .resolve("system_health", Some("System healthy again"))
                                    .await;
                            }
                        }
                        HealthStatus::Unknown => {}
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop every rule loop, silence expiry task, and event bridge.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for handle in tasks.drain(..) {
            handle.abort();
        }
        info!("alert engine shut down");
    }
}

impl Drop for AlertEngine {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        fn name(&self) -> &str {
            "counting"
        }

        async fn notify(&self, _alert: &Alert) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait::async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _alert: &Alert) -> Result<()> {
            Err(OpsError::Delivery {
                notifier: "failing".into(),
                reason: "sink offline".into(),
            })
        }
    }

    fn engine() -> Arc<AlertEngine> {
        Arc::new(AlertEngine::new(1000))
    }

    #[tokio::test]
    async fn test_raise_and_resolve_roundtrip() {
        let engine = engine();
        let alert = engine
            .raise("disk_full", "disk 95%", Severity::Error, vec!["node1".into()])
            .await
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Active);
        assert!(engine.is_active("disk_full").await);

        assert!(engine.resolve("disk_full", Some("freed space")).await);
        assert!(!engine.is_active("disk_full").await);

        let history = engine.history(None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AlertStatus::Resolved);
        assert_eq!(history[0].resolution_message.as_deref(), Some("freed space"));

        assert!(!engine.resolve("disk_full", None).await);
    }

    #[tokio::test]
    async fn test_active_alert_uniqueness_per_name() {
        let engine = engine();
        engine.raise("cpu_high", "one", Severity::Warning, vec![]).await;
        engine.raise("cpu_high", "two", Severity::Warning, vec![]).await;

        let active = engine.active_alerts().await;
        assert_eq!(active.len(), 1);
        // Re-raising after resolve produces a fresh id.
        let first_id = active[0].id.clone();
        engine.resolve("cpu_high", None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = engine
            .raise("cpu_high", "three", Severity::Warning, vec![])
            .await
            .unwrap();
        assert_ne!(again.id, first_id);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let engine = Arc::new(AlertEngine::new(5));
        for i in 0..12 {
            let name = format!("a{i}");
            engine.raise(&name, "x", Severity::Info, vec![]).await;
            engine.resolve(&name, None).await;
        }
        assert_eq!(engine.history(None).await.len(), 5);
        // Newest first.
        assert_eq!(engine.history(None).await[0].name, "a11");
    }

    #[tokio::test]
    async fn test_silence_blocks_raise_and_notifiers() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        engine.add_notifier(Arc::new(CountingNotifier { calls: calls.clone() }));

        engine
            .silence("disk_full", vec![], Duration::from_secs(3600), "ops", None)
            .await;

        let raised = engine
            .raise("disk_full", "full", Severity::Error, vec!["node1".into()])
            .await;
        assert!(raised.is_none());
        assert!(!engine.is_active("disk_full").await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silence_flips_active_alert_and_unsilence_restores() {
        let engine = engine();
        engine
            .raise("db_slow", "slow queries", Severity::Warning, vec![])
            .await;

        let silence_id = engine
            .silence("db_slow", vec![], Duration::from_secs(0), "ops", None)
            .await;
        let active = engine.active_alerts().await;
        assert_eq!(active[0].status, AlertStatus::Silenced);
        assert_eq!(active[0].silenced_by.as_deref(), Some(silence_id.as_str()));

        assert!(engine.unsilence(&silence_id).await);
        let active = engine.active_alerts().await;
        assert_eq!(active[0].status, AlertStatus::Active);
        assert!(active[0].silenced_by.is_none());
        assert!(engine.silences().await.is_empty());

        assert!(!engine.unsilence(&silence_id).await);
    }

    #[tokio::test]
    async fn test_wildcard_silence_requires_label_subset() {
        let engine = engine();
        engine
            .silence("*", vec!["batch".into()], Duration::from_secs(60), "ops", None)
            .await;

        // Label matches: suppressed.
        assert!(engine
            .raise("job_failed", "x", Severity::Error, vec!["batch".into(), "eu".into()])
            .await
            .is_none());
        // Label missing: raised.
        assert!(engine
            .raise("job_failed", "x", Severity::Error, vec!["eu".into()])
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_acknowledge_keeps_alert_active() {
        let engine = engine();
        engine.raise("mem_high", "mem", Severity::Warning, vec![]).await;

        assert!(engine.acknowledge("mem_high", "alice", Some("looking")).await);
        let active = engine.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, AlertStatus::Acknowledged);
        assert_eq!(active[0].acknowledged_by.as_deref(), Some("alice"));

        assert!(!engine.acknowledge("missing", "bob", None).await);
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_block_raise_or_peers() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        engine.add_notifier(Arc::new(FailingNotifier));
        engine.add_notifier(Arc::new(CountingNotifier { calls: calls.clone() }));

        let alert = engine
            .raise("queue_backlog", "deep", Severity::Error, vec![])
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(alert.deliveries.len(), 2);
        assert!(!alert.deliveries[0].success);
        assert!(alert.deliveries[1].success);
    }

    #[tokio::test]
    async fn test_rule_raises_and_resolves_on_condition() {
        let engine = engine();
        let triggered = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = triggered.clone();
        let condition: ConditionFn = Arc::new(move || {
            let flag = flag.clone();
            Box::pin(async move { Ok(flag.load(Ordering::SeqCst).into()) })
        });

        engine
            .add_rule(AlertRule {
                name: "flappy".into(),
                condition,
                message: "flap".into(),
                severity: Severity::Warning,
                labels: vec![],
                check_interval: Duration::from_millis(20),
                auto_resolve_after: None,
                enabled: true,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_active("flappy").await);

        triggered.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!engine.is_active("flappy").await);
        let history = engine.history(None).await;
        assert_eq!(
            history[0].resolution_message.as_deref(),
            Some("Condition no longer met")
        );
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_rule_condition_error_is_falsey() {
        let engine = engine();
        let condition: ConditionFn =
            Arc::new(|| Box::pin(async { Err(OpsError::Unknown("oops".into())) }));
        engine
            .add_rule(AlertRule {
                name: "broken".into(),
                condition,
                message: "x".into(),
                severity: Severity::Error,
                labels: vec![],
                check_interval: Duration::from_millis(20),
                auto_resolve_after: None,
                enabled: true,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!engine.is_active("broken").await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_metric_rule_threshold() {
        let engine = engine();
        let value = Arc::new(parking_lot::Mutex::new(95.0f64));
        let reader = value.clone();
        engine
            .add_metric_rule(
                "cpu_high",
                Arc::new(move || *reader.lock()),
                Comparison::Gt,
                90.0,
                Severity::Critical,
                "CPU above 90%",
                Duration::from_millis(20),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_active("cpu_high").await);

        *value.lock() = 40.0;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!engine.is_active("cpu_high").await);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_rule_validation_is_eager() {
        let engine = engine();
        let condition: ConditionFn = Arc::new(|| Box::pin(async { Ok(true.into()) }));
        let rule = |name: &str, interval| AlertRule {
            name: name.into(),
            condition: condition.clone(),
            message: "m".into(),
            severity: Severity::Info,
            labels: vec![],
            check_interval: interval,
            auto_resolve_after: None,
            enabled: false,
        };

        assert!(engine.add_rule(rule("", Duration::from_secs(1))).is_err());
        assert!(engine.add_rule(rule("ok", Duration::ZERO)).is_err());
        assert!(engine.add_rule(rule("ok", Duration::from_secs(1))).is_ok());
        assert!(engine.add_rule(rule("ok", Duration::from_secs(1))).is_err());
    }

    #[tokio::test]
    async fn test_comparison_operators() {
        assert!(Comparison::Gt.evaluate(2.0, 1.0));
        assert!(Comparison::Lt.evaluate(1.0, 2.0));
        assert!(Comparison::Ge.evaluate(2.0, 2.0));
        assert!(Comparison::Le.evaluate(2.0, 2.0));
        assert!(Comparison::Eq.evaluate(2.0, 2.0));
        assert!(Comparison::Ne.evaluate(2.0, 3.0));
    }
}
