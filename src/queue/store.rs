//! Queue storage seam.
//!
//! The job queue is backed by a pluggable store; id uniqueness and
//! claim-next atomicity are the store's responsibility. [`InMemoryQueueStore`]
//! is the reference implementation used by tests and the default wiring.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::{Job, JobStatus, QueueCounts};
use crate::error::{OpsError, Result};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new job. Fails if the id already exists in the queue.
    async fn enqueue(&self, job: Job) -> Result<()>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool>;

    /// Atomically claim the next runnable job (waiting, or delayed and due)
    /// and mark it active.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    async fn list_jobs(&self, queue: &str, statuses: &[JobStatus]) -> Result<Vec<Job>>;

    async fn clear(&self, queue: &str) -> Result<()>;
}

#[derive(Default)]
struct QueueData {
    jobs: HashMap<String, Job>,
    // FIFO claim order.
    order: VecDeque<String>,
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<String, QueueData>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut queues = self.queues.lock();
        let data = queues.entry(job.queue.clone()).or_default();
        if data.jobs.contains_key(&job.id) {
            return Err(OpsError::Queue(format!(
                "job {} already exists in queue {}",
                job.id, job.queue
            )));
        }
        data.order.push_back(job.id.clone());
        data.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .and_then(|data| data.jobs.get(id))
            .cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut queues = self.queues.lock();
        let data = queues
            .get_mut(&job.queue)
            .ok_or_else(|| OpsError::Lookup(format!("queue {} not found", job.queue)))?;
        let slot = data
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| OpsError::Lookup(format!("job {} not found", job.id)))?;
        *slot = job.clone();
        // A job going back to waiting or delayed must be claimable again.
        if matches!(job.status, JobStatus::Waiting | JobStatus::Delayed)
            && !data.order.contains(&job.id)
        {
            data.order.push_back(job.id.clone());
        }
        Ok(())
    }

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool> {
        let mut queues = self.queues.lock();
        let Some(data) = queues.get_mut(queue) else {
            return Ok(false);
        };
        data.order.retain(|j| j != id);
        Ok(data.jobs.remove(id).is_some())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut queues = self.queues.lock();
        let Some(data) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Utc::now();
        let mut deferred = VecDeque::new();
        let mut claimed = None;

        while let Some(id) = data.order.pop_front() {
            let Some(job) = data.jobs.get_mut(&id) else {
                continue;
            };
            let runnable = match job.status {
                JobStatus::Waiting => true,
                JobStatus::Delayed => job.available_at.is_none_or(|at| at <= now),
                _ => false,
            };
            if runnable {
                job.status = JobStatus::Active;
                job.updated_at = now;
                claimed = Some(job.clone());
                break;
            }
            deferred.push_back(id);
        }

        // Jobs that were not runnable keep their claim-order position.
        while let Some(id) = deferred.pop_back() {
            data.order.push_front(id);
        }
        Ok(claimed)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let queues = self.queues.lock();
        let mut counts = QueueCounts::default();
        if let Some(data) = queues.get(queue) {
            for job in data.jobs.values() {
                match job.status {
                    JobStatus::Waiting => counts.waiting += 1,
                    JobStatus::Active => counts.active += 1,
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                    JobStatus::Delayed => counts.delayed += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn list_jobs(&self, queue: &str, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|data| {
                data.jobs
                    .values()
                    .filter(|j| statuses.contains(&j.status))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        if let Some(data) = self.queues.lock().get_mut(queue) {
            data.jobs.clear();
            data.order.clear();
        }
        Ok(())
    }
}
