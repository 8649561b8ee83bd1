//! Named durable job queues with consumer workers and lifecycle events.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::QueueStore;
use super::{Job, JobOptions, JobStatus, QueueCounts, QueueEvent};
use crate::error::{OpsError, Result};
use crate::monitoring::adapters::{QueueSystemAdapter, QueueSystemStats};
use crate::retry::backoff_delay;

/// How long an idle worker sleeps before polling the store again.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Cap for per-job retry backoff.
const MAX_JOB_BACKOFF: Duration = Duration::from_secs(60);

pub type ProcessorFn = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub struct JobQueue {
    name: String,
    store: Arc<dyn QueueStore>,
    events: broadcast::Sender<QueueEvent>,
    processor: RwLock<Option<ProcessorFn>>,
    paused: AtomicBool,
    closed: AtomicBool,
    worker_count: AtomicU32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn QueueStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            name: name.into(),
            store,
            events,
            processor: RwLock::new(None),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker_count: AtomicU32::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub async fn add(&self, data: Value, opts: JobOptions) -> Result<Job> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsError::Queue(format!("queue {} is closed", self.name)));
        }
        let job = Job::new(&self.name, data, opts);
        self.store.enqueue(job.clone()).await?;
        let _ = self.events.send(QueueEvent::Waiting { id: job.id.clone() });
        debug!("enqueued job {} on {}", job.id, self.name);
        Ok(job)
    }

    pub async fn add_bulk(&self, jobs: Vec<(Value, JobOptions)>) -> Result<Vec<Job>> {
        let mut added = Vec::with_capacity(jobs.len());
        for (data, opts) in jobs {
            added.push(self.add(data, opts).await?);
        }
        Ok(added)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(&self.name, id).await
    }

    pub async fn update_job(&self, job: &Job) -> Result<()> {
        self.store.update_job(job).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.remove_job(&self.name, id).await
    }

    pub async fn status(&self) -> Result<QueueCounts> {
        self.store.counts(&self.name).await
    }

    pub async fn list_jobs(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        self.store.list_jobs(&self.name, statuses).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear(&self.name).await
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("queue {} paused", self.name);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("queue {} resumed", self.name);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> u32 {
        self.worker_count.load(Ordering::SeqCst)
    }

    /// Install the consumer and spawn `concurrency` workers.
    pub fn set_processor(self: &Arc<Self>, processor: ProcessorFn, concurrency: u32) {
        *self.processor.write() = Some(processor);
        self.scale_workers(concurrency.max(1));
    }

    /// Raise the worker count to `target`. Shrinking a live pool is not
    /// supported; extra capacity stays until close.
    pub fn scale_workers(self: &Arc<Self>, target: u32) {
        if self.processor.read().is_none() {
            warn!("queue {} has no processor, cannot scale workers", self.name);
            return;
        }
        let current = self.worker_count.load(Ordering::SeqCst);
        if target <= current {
            if target < current {
                warn!(
                    "queue {} cannot shrink workers from {} to {}",
                    self.name, current, target
                );
            }
            return;
        }
        for _ in current..target {
            let queue = self.clone();
            let handle = tokio::spawn(async move { queue.worker_loop().await });
            self.workers.lock().push(handle);
        }
        self.worker_count.store(target, Ordering::SeqCst);
        info!("queue {} scaled to {} workers", self.name, target);
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                continue;
            }

            let job = match self.store.claim_next(&self.name).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => {
                    warn!("queue {} claim failed: {}", self.name, e);
                    tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                    continue;
                }
            };

            let _ = self.events.send(QueueEvent::Active { id: job.id.clone() });
            let processor = self.processor.read().clone();
            let Some(processor) = processor else {
                // Claimed without a processor installed: park it back.
                let _ = self.events.send(QueueEvent::Stalled { id: job.id.clone() });
                let mut stalled = job;
                stalled.status = JobStatus::Waiting;
                let _ = self.store.update_job(&stalled).await;
                tokio::time::sleep(WORKER_POLL_INTERVAL).await;
                continue;
            };

            match processor(job.clone()).await {
                Ok(_) => self.complete_job(job).await,
                Err(e) => self.fail_job(job, e).await,
            }
        }
    }

    async fn complete_job(&self, mut job: Job) {
        job.attempts += 1;
        if job.opts.remove_on_complete {
            if let Err(e) = self.store.remove_job(&self.name, &job.id).await {
                warn!("queue {} failed to remove completed job: {}", self.name, e);
            }
        } else {
            job.status = JobStatus::Completed;
            job.updated_at = chrono::Utc::now();
            if let Err(e) = self.store.update_job(&job).await {
                warn!("queue {} failed to store completion: {}", self.name, e);
            }
        }
        let _ = self.events.send(QueueEvent::Completed { id: job.id });
    }

    async fn fail_job(&self, mut job: Job, error: OpsError) {
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.updated_at = chrono::Utc::now();

        if job.attempts < job.opts.attempts {
            let delay = backoff_delay(job.opts.backoff_base, job.attempts, MAX_JOB_BACKOFF);
            job.status = JobStatus::Delayed;
            job.available_at =
                Some(chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            debug!(
                "job {} attempt {}/{} failed, retrying in {:?}",
                job.id, job.attempts, job.opts.attempts, delay
            );
            if let Err(e) = self.store.update_job(&job).await {
                warn!("queue {} failed to schedule retry: {}", self.name, e);
            }
            let _ = self.events.send(QueueEvent::Waiting { id: job.id });
        } else {
            job.status = JobStatus::Failed;
            warn!(
                "job {} failed permanently after {} attempts: {}",
                job.id, job.attempts, error
            );
            if let Err(e) = self.store.update_job(&job).await {
                warn!("queue {} failed to store failure: {}", self.name, e);
            }
            let _ = self.events.send(QueueEvent::Failed {
                id: job.id,
                error: error.to_string(),
            });
        }
    }

    /// Stop workers and reject further adds.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
        self.worker_count.store(0, Ordering::SeqCst);
        info!("queue {} closed", self.name);
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Process-level registry deduplicating queues by name.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    queues: Mutex<HashMap<String, Arc<JobQueue>>>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Get or create the queue with this name.
    pub fn queue(&self, name: &str) -> Arc<JobQueue> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| JobQueue::new(name, self.store.clone()))
            .clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    pub fn close_all(&self) {
        for queue in self.queues.lock().values() {
            queue.close();
        }
    }
}

/// Exposes the queue layer to the monitoring façade.
pub struct QueueMonitoringAdapter {
    manager: Arc<QueueManager>,
}

impl QueueMonitoringAdapter {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl QueueSystemAdapter for QueueMonitoringAdapter {
    async fn ready(&self) -> Result<()> {
        // The in-process layer is ready as long as the store answers.
        let names = self.manager.queue_names();
        for name in names {
            self.manager.queue(&name).status().await?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueSystemStats> {
        let mut total_backlog = 0;
        let mut backlog_per_queue = HashMap::new();
        let mut concurrency = 0;
        let mut failed = 0;

        for name in self.manager.queue_names() {
            let queue = self.manager.queue(&name);
            let counts = queue.status().await?;
            total_backlog += counts.backlog();
            failed += counts.failed;
            backlog_per_queue.insert(name, counts.backlog());
            concurrency += queue.concurrency();
        }

        Ok(QueueSystemStats {
            total_backlog,
            backlog_per_queue,
            concurrency,
            failed_last_hour: failed,
        })
    }

    async fn apply_concurrency(&self, concurrency: u32) -> Result<()> {
        // Spread the target evenly across consuming queues.
        let consuming: Vec<Arc<JobQueue>> = self
            .manager
            .queue_names()
            .into_iter()
            .map(|n| self.manager.queue(&n))
            .filter(|q| q.concurrency() > 0)
            .collect();
        if consuming.is_empty() {
            return Ok(());
        }
        let per_queue = (concurrency / consuming.len() as u32).max(1);
        for queue in consuming {
            queue.scale_workers(per_queue);
        }
        Ok(())
    }
}
