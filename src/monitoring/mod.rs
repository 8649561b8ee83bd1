pub mod adapters;
pub mod alerts;
pub mod api;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod optimization;
pub mod service;
pub mod system_collector;

pub use adapters::{CacheServiceAdapter, DatabaseAdapter, QueueSystemAdapter};
pub use alerts::{Alert, AlertEngine, AlertRule, AlertStatus, Comparison, Silence};
pub use api::monitoring_router;
pub use health::{HealthRegistry, HealthState, HealthStatus};
pub use metrics::{MetricDescriptor, MetricKind, MetricRegistry, MetricValue};
pub use notify::{EmailNotifier, LogNotifier, Notifier, WebhookNotifier};
pub use optimization::{OptimizationLoop, OptimizationState, Optimizer};
pub use service::{track_requests, MonitoringService};
pub use system_collector::SystemCollector;

use serde::{Deserialize, Serialize};

/// Alert severity, ordered so per-sink filters can express "warning and up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_supports_filters() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_severity_parse_roundtrip() {
        for s in ["info", "warning", "error", "critical"] {
            let sev: Severity = s.parse().unwrap();
            assert_eq!(sev.as_str(), s);
        }
        assert!("fatal".parse::<Severity>().is_err());
    }
}
