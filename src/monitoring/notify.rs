//! Alert delivery sinks.
//!
//! Notifiers are fanned out to by the alert engine on every raise. Delivery
//! is best-effort per sink: a failing webhook never blocks the logger or the
//! raise itself, and each attempt lands in the alert's delivery log.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::alerts::Alert;
use super::Severity;
use crate::error::Result;

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<()>;

    /// Per-sink severity filter; defaults to accepting everything.
    fn filter(&self, alert: &Alert) -> bool {
        let _ = alert;
        true
    }
}

/// Built-in sink mapping alert severity onto log levels.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "logger"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::Error => {
                error!("[ALERT] {}: {}", alert.name, alert.message)
            }
            Severity::Warning => warn!("[ALERT] {}: {}", alert.name, alert.message),
            Severity::Info => info!("[ALERT] {}: {}", alert.name, alert.message),
        }
        Ok(())
    }
}

/// Chat-webhook sink posting the alert as JSON.
pub struct WebhookNotifier {
    name: String,
    client: reqwest::Client,
    url: String,
    min_severity: Severity,
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>, client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            min_severity: Severity::Warning,
        }
    }

    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.min_severity = min_severity;
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "alert": alert.name,
            "message": alert.message,
            "severity": alert.severity.as_str(),
            "labels": alert.labels,
            "created_at": alert.created_at,
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::OpsError::Delivery {
                notifier: self.name.clone(),
                reason: format!("webhook returned {}", response.status()),
            });
        }
        Ok(())
    }

    fn filter(&self, alert: &Alert) -> bool {
        alert.severity >= self.min_severity
    }
}

/// Email sink delivering through an HTTP mail gateway.
pub struct EmailNotifier {
    client: reqwest::Client,
    gateway_url: String,
    from: String,
    to: Vec<String>,
    min_severity: Severity,
}

impl EmailNotifier {
    pub fn new(
        client: reqwest::Client,
        gateway_url: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
    ) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
            from: from.into(),
            to,
            min_severity: Severity::Error,
        }
    }

    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.min_severity = min_severity;
        self
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "from": self.from,
            "to": self.to,
            "subject": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.name),
            "body": alert.message,
        });
        let response = self
            .client
            .post(&self.gateway_url)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(crate::error::OpsError::Delivery {
                notifier: "email".to_string(),
                reason: format!("mail gateway returned {}", response.status()),
            });
        }
        Ok(())
    }

    fn filter(&self, alert: &Alert) -> bool {
        alert.severity >= self.min_severity
    }
}
