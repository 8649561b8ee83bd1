pub mod dlq;
pub mod job_queue;
pub mod processor;
pub mod store;

pub use dlq::{DeadLetterQueue, DlqRecord, RetryFilters};
pub use job_queue::{JobQueue, ProcessorFn, QueueManager, QueueMonitoringAdapter};
pub use processor::{HandlerFn, MessageProcessor, ProcessorEvent};
pub use store::{InMemoryQueueStore, QueueStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// A typed message routed through the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(default)]
    pub attempts: u32,
    /// Queue the message came from, if any; used for dead-letter context.
    #[serde(default)]
    pub source_queue: Option<String>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            data,
            attempts: 0,
            source_queue: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts before the job is marked failed.
    pub attempts: u32,
    /// Base delay for retry backoff; doubles per attempt.
    pub backoff_base: Duration,
    pub remove_on_complete: bool,
    pub delay: Option<Duration>,
    /// Explicit job id; defaults to a fresh UUID.
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            remove_on_complete: true,
            delay: None,
            job_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub data: Value,
    pub opts: JobOptions,
    /// Attempts made so far.
    pub attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a delayed job becomes claimable.
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: &str, data: Value, opts: JobOptions) -> Self {
        let now = Utc::now();
        let (status, available_at) = match opts.delay {
            Some(delay) => (
                JobStatus::Delayed,
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
            ),
            None => (JobStatus::Waiting, None),
        };
        Self {
            id: opts
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            queue: queue.to_string(),
            data,
            opts,
            attempts: 0,
            status,
            created_at: now,
            updated_at: now,
            available_at,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueCounts {
    /// Jobs that still need a worker.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.delayed
    }
}

/// Lifecycle events published per queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Waiting { id: String },
    Active { id: String },
    Completed { id: String },
    Failed { id: String, error: String },
    Stalled { id: String },
}
