use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    Lookup(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Lock contention on {key}")]
    LockContention { key: String },

    #[error("Notification delivery failed via {notifier}: {reason}")]
    Delivery { notifier: String, reason: String },

    #[error("Optimizer {name} failed: {reason}")]
    Optimizer { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl OpsError {
    /// Transient errors are safe to retry; everything else should surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OpsError::Transient(_) | OpsError::Timeout { .. } | OpsError::LockContention { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
