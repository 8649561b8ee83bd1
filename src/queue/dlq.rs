//! Dead-letter queue: parks permanently failed messages with retry
//! bookkeeping, supports manual and filtered batch retry, and sweeps out
//! records older than the TTL.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job_queue::{JobQueue, QueueManager};
use super::{Job, JobOptions, JobStatus, Message};
use crate::config::QueueConfig;
use crate::error::Result;

pub const DLQ_QUEUE_NAME: &str = "dead-letter-queue";
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3_600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqContext {
    pub failed_at: DateTime<Utc>,
    pub original_queue: String,
    pub attempts: u32,
}

impl Default for DlqContext {
    fn default() -> Self {
        Self {
            failed_at: Utc::now(),
            original_queue: "unknown".to_string(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMeta {
    pub added_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for DlqMeta {
    fn default() -> Self {
        Self {
            added_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub original_message: Message,
    pub error: DlqError,
    #[serde(default)]
    pub context: DlqContext,
    #[serde(default)]
    pub meta: DlqMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryFilters {
    /// Only retry records at least this old.
    pub min_age: Option<Duration>,
    /// Skip records that already reached this many retries.
    pub max_retries: Option<u32>,
    /// Only retry records that came from this queue.
    pub queue_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRetryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct DeadLetterQueue {
    queue: Arc<JobQueue>,
    manager: Arc<QueueManager>,
    max_retries: u32,
    ttl: chrono::Duration,
    retry_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DeadLetterQueue {
    /// Create the dead-letter queue on top of the shared queue manager.
    /// The sweeper only runs outside test mode.
    pub fn new(manager: Arc<QueueManager>, config: &QueueConfig, test_mode: bool) -> Arc<Self> {
        let queue = manager.queue(DLQ_QUEUE_NAME);
        let dlq = Arc::new(Self {
            queue,
            manager,
            max_retries: config.dlq_max_retries,
            ttl: chrono::Duration::seconds(config.dlq_ttl_secs as i64),
            retry_interval: Duration::from_millis(config.retry_delay_ms),
            sweeper: Mutex::new(None),
        });
        if !test_mode {
            dlq.start_sweeper();
        }
        dlq
    }

    fn job_id(message_id: &str) -> String {
        if message_id.starts_with("dlq:") {
            message_id.to_string()
        } else {
            format!("dlq:{message_id}")
        }
    }

    /// Park a permanently failed message.
    pub async fn add_failed_message(&self, message: &Message, error: &str) -> Result<Job> {
        let record = DlqRecord {
            original_message: message.clone(),
            error: DlqError {
                message: error.to_string(),
                stack: None,
            },
            context: DlqContext {
                failed_at: Utc::now(),
                original_queue: message
                    .source_queue
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                attempts: message.attempts,
            },
            meta: DlqMeta::default(),
        };

        let job = self
            .queue
            .add(
                serde_json::to_value(&record)?,
                JobOptions {
                    attempts: 1,
                    remove_on_complete: false,
                    job_id: Some(Self::job_id(&message.id)),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            "dead-lettered message {} from {}",
            message.id, record.context.original_queue
        );
        Ok(job)
    }

    pub async fn get_record(&self, message_id: &str) -> Result<Option<DlqRecord>> {
        match self.queue.get_job(&Self::job_id(message_id)).await? {
            Some(job) => Ok(Some(serde_json::from_value(job.data)?)),
            None => Ok(None),
        }
    }

    /// Number of records currently parked.
    pub async fn total(&self) -> Result<u64> {
        let counts = self.queue.status().await?;
        Ok(counts.waiting + counts.active + counts.failed + counts.delayed)
    }

    /// Re-enqueue a parked message onto its original queue. Returns false
    /// when there is nothing to retry or the retry budget is spent.
    pub async fn retry_message(&self, message_id: &str) -> Result<bool> {
        let job_id = Self::job_id(message_id);
        let Some(mut job) = self.queue.get_job(&job_id).await? else {
            warn!("no dead-letter record for {}", message_id);
            return Ok(false);
        };

        // Older records may predate the meta/context fields; serde fills
        // the defaults.
        let mut record: DlqRecord = serde_json::from_value(job.data.clone())?;

        if record.meta.retry_count >= self.max_retries {
            warn!(
                "dead-letter record {} exhausted its {} retries",
                message_id, self.max_retries
            );
            return Ok(false);
        }

        let now = Utc::now();
        record.meta.retry_count += 1;
        record.meta.last_retry_at = Some(now);
        let backoff = self.retry_interval.as_millis() as i64
            * 2_i64.saturating_pow(record.meta.retry_count);
        record.meta.next_retry_at = Some(now + chrono::Duration::milliseconds(backoff));

        let target = self.manager.queue(&record.context.original_queue);
        target
            .add(
                serde_json::to_value(&record.original_message)?,
                JobOptions {
                    attempts: 1,
                    ..Default::default()
                },
            )
            .await?;

        job.data = serde_json::to_value(&record)?;
        self.queue.update_job(&job).await?;
        debug!(
            "re-enqueued {} onto {} (retry {})",
            message_id, record.context.original_queue, record.meta.retry_count
        );
        Ok(true)
    }

    /// Retry every parked record that passes the filters.
    pub async fn retry_batch(&self, filters: &RetryFilters) -> Result<BatchRetryReport> {
        let jobs = self
            .queue
            .list_jobs(&[JobStatus::Waiting, JobStatus::Failed])
            .await?;
        let now = Utc::now();
        let mut report = BatchRetryReport {
            total: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let record: DlqRecord = match serde_json::from_value(job.data.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("malformed dead-letter record {}: {}", job.id, e);
                    report.skipped += 1;
                    continue;
                }
            };

            if let Some(min_age) = filters.min_age {
                let age = now.signed_duration_since(record.meta.added_at);
                if age < chrono::Duration::from_std(min_age).unwrap_or_default() {
                    report.skipped += 1;
                    continue;
                }
            }
            if let Some(max_retries) = filters.max_retries {
                if record.meta.retry_count >= max_retries {
                    report.skipped += 1;
                    continue;
                }
            }
            if let Some(queue_name) = &filters.queue_name {
                if &record.context.original_queue != queue_name {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.retry_message(&record.original_message.id).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    warn!("batch retry of {} failed: {}", record.original_message.id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Remove records older than the TTL. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let jobs = self
            .queue
            .list_jobs(&[
                JobStatus::Waiting,
                JobStatus::Active,
                JobStatus::Failed,
                JobStatus::Delayed,
            ])
            .await?;
        let cutoff = Utc::now() - self.ttl;
        let mut removed = 0;

        for job in jobs {
            let added_at = serde_json::from_value::<DlqRecord>(job.data.clone())
                .map(|r| r.meta.added_at)
                .unwrap_or(job.created_at);
            if added_at < cutoff && self.queue.remove(&job.id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("dead-letter cleanup removed {} expired records", removed);
        }
        Ok(removed)
    }

    fn start_sweeper(self: &Arc<Self>) {
        let dlq = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                if let Err(e) = dlq.cleanup().await {
                    warn!("dead-letter sweep failed: {}", e);
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for DeadLetterQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
