//! Message processor: typed handler dispatch with an in-flight guard,
//! per-message timeout, and capped exponential retry. Messages that exhaust
//! their retries are handed to the dead-letter queue when one is wired.

use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::dlq::DeadLetterQueue;
use super::Message;
use crate::config::QueueConfig;
use crate::error::{OpsError, Result};
use crate::retry::backoff_delay;

/// Cap for per-retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    Processed { id: String },
    Failed { id: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
    pub processed: usize,
    pub failed: usize,
}

pub struct MessageProcessor {
    handlers: RwLock<HashMap<String, HandlerFn>>,
    in_flight: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    events: broadcast::Sender<ProcessorEvent>,
    dead_letter: RwLock<Option<Arc<DeadLetterQueue>>>,
}

impl MessageProcessor {
    pub fn new(config: &QueueConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            timeout: Duration::from_millis(config.message_timeout_ms),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            events,
            dead_letter: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    /// Route permanently failed messages into this dead-letter queue.
    pub fn set_dead_letter_queue(&self, dlq: Arc<DeadLetterQueue>) {
        *self.dead_letter.write() = Some(dlq);
    }

    pub fn register_handler(&self, message_type: &str, handler: HandlerFn) -> Result<()> {
        if message_type.is_empty() {
            return Err(OpsError::Config("message type must not be empty".into()));
        }
        if self
            .handlers
            .write()
            .insert(message_type.to_string(), handler)
            .is_some()
        {
            warn!("replaced handler for message type {}", message_type);
        }
        Ok(())
    }

    pub async fn process(&self, message: Message) -> Result<Value> {
        let handler = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .ok_or_else(|| {
                OpsError::Lookup(format!(
                    "no handler for message type {}",
                    message.message_type
                ))
            })?;

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&message.id) {
                return Err(OpsError::Validation(format!(
                    "message {} is already being processed",
                    message.id
                )));
            }
            in_flight.insert(message.id.clone(), Instant::now());
        }

        let mut attempts = message.attempts;
        let outcome = loop {
            let run = tokio::time::timeout(self.timeout, handler(message.data.clone())).await;
            let error = match run {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(e)) => e,
                Err(_) => OpsError::Timeout {
                    operation: format!("message {}", message.id),
                    timeout_ms: self.timeout.as_millis() as u64,
                },
            };

            if attempts < self.max_retries {
                attempts += 1;
                let delay = backoff_delay(self.retry_delay, attempts, MAX_RETRY_DELAY);
                debug!(
                    "message {} attempt {} failed ({}), retrying in {:?}",
                    message.id, attempts, error, delay
                );
                tokio::time::sleep(delay).await;
            } else {
                break Err(error);
            }
        };

        self.in_flight.lock().remove(&message.id);

        match outcome {
            Ok(value) => {
                let _ = self.events.send(ProcessorEvent::Processed {
                    id: message.id.clone(),
                });
                Ok(value)
            }
            Err(error) => {
                warn!(
                    "message {} failed permanently after {} attempts: {}",
                    message.id, attempts, error
                );
                let _ = self.events.send(ProcessorEvent::Failed {
                    id: message.id.clone(),
                    error: error.to_string(),
                });
                let dlq_opt = self.dead_letter.read().clone();
                if let Some(dlq) = dlq_opt {
                    let mut failed = message.clone();
                    failed.attempts = attempts;
                    if let Err(e) = dlq.add_failed_message(&failed, &error.to_string()).await {
                        warn!("dead-lettering of {} failed: {}", message.id, e);
                    }
                }
                Err(error)
            }
        }
    }

    /// Process a batch concurrently, reporting per-message outcomes.
    pub async fn process_batch(&self, messages: Vec<Message>) -> BatchReport {
        let runs = messages.into_iter().map(|message| {
            let id = message.id.clone();
            async move { (id, self.process(message).await) }
        });

        let mut outcomes = Vec::new();
        let mut processed = 0;
        let mut failed = 0;
        for (id, result) in join_all(runs).await {
            match result {
                Ok(value) => {
                    processed += 1;
                    outcomes.push(BatchOutcome {
                        id,
                        success: true,
                        result: Some(value),
                        error: None,
                    });
                }
                Err(e) => {
                    failed += 1;
                    outcomes.push(BatchOutcome {
                        id,
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        BatchReport {
            outcomes,
            processed,
            failed,
        }
    }

    /// Evict in-flight entries whose wall-clock age exceeds the timeout.
    /// The timeout race normally handles this; stale entries mean a task
    /// died without unwinding.
    pub fn cleanup_timed_out(&self) -> usize {
        let mut in_flight = self.in_flight.lock();
        let before = in_flight.len();
        let timeout = self.timeout;
        in_flight.retain(|_, started| started.elapsed() <= timeout);
        before - in_flight.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processor(max_retries: u32, retry_delay_ms: u64, timeout_ms: u64) -> MessageProcessor {
        MessageProcessor::new(&QueueConfig {
            max_retries,
            retry_delay_ms,
            message_timeout_ms: timeout_ms,
            ..Default::default()
        })
    }

    fn message(id: &str, message_type: &str) -> Message {
        Message {
            id: id.to_string(),
            message_type: message_type.to_string(),
            data: serde_json::json!({}),
            attempts: 0,
            source_queue: None,
        }
    }

    #[tokio::test]
    async fn test_success_emits_processed() {
        let processor = processor(3, 10, 1_000);
        processor
            .register_handler("t", Arc::new(|_| Box::pin(async { Ok(serde_json::json!("ok")) })))
            .unwrap();
        let mut events = processor.subscribe();

        let result = processor.process(message("m1", "t")).await.unwrap();
        assert_eq!(result, serde_json::json!("ok"));
        assert_eq!(processor.in_flight_count(), 0);

        assert!(matches!(
            events.try_recv(),
            Ok(ProcessorEvent::Processed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_is_lookup_error() {
        let processor = processor(3, 10, 1_000);
        let err = processor.process(message("m1", "ghost")).await.unwrap_err();
        assert!(matches!(err, OpsError::Lookup(_)));
    }

    #[tokio::test]
    async fn test_retries_with_backoff_then_succeeds() {
        let processor = processor(3, 100, 1_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        processor
            .register_handler(
                "t",
                Arc::new(move |_| {
                    let calls = handler_calls.clone();
                    Box::pin(async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(OpsError::Transient("flaky".into()))
                        } else {
                            Ok(serde_json::json!("ok"))
                        }
                    })
                }),
            )
            .unwrap();

        let start = Instant::now();
        let result = processor.process(message("j1", "t")).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, serde_json::json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two retries: 100ms then 200ms of backoff.
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_exhausted_retries_emit_failed() {
        let processor = processor(2, 5, 1_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        processor
            .register_handler(
                "t",
                Arc::new(move |_| {
                    let calls = handler_calls.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(OpsError::Transient("always".into()))
                    })
                }),
            )
            .unwrap();
        let mut events = processor.subscribe();

        let err = processor.process(message("m2", "t")).await.unwrap_err();
        assert!(matches!(err, OpsError::Transient(_)));
        // Initial run plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.in_flight_count(), 0);

        assert!(matches!(
            events.try_recv(),
            Ok(ProcessorEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_triggers_retry() {
        let processor = processor(1, 5, 30);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        processor
            .register_handler(
                "t",
                Arc::new(move |_| {
                    let calls = handler_calls.clone();
                    Box::pin(async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        Ok(serde_json::json!("late"))
                    })
                }),
            )
            .unwrap();

        let result = processor.process(message("m3", "t")).await.unwrap();
        assert_eq!(result, serde_json::json!("late"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_rejected() {
        let processor = Arc::new(processor(0, 5, 1_000));
        processor
            .register_handler(
                "slow",
                Arc::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(serde_json::json!("done"))
                    })
                }),
            )
            .unwrap();

        let first = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.process(message("dup", "slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = processor.process(message("dup", "slow")).await.unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_batch_reports_mixed_outcomes() {
        let processor = processor(0, 5, 1_000);
        processor
            .register_handler("ok", Arc::new(|_| Box::pin(async { Ok(serde_json::json!(1)) })))
            .unwrap();
        processor
            .register_handler(
                "bad",
                Arc::new(|_| Box::pin(async { Err(OpsError::Transient("no".into())) })),
            )
            .unwrap();

        let report = processor
            .process_batch(vec![
                message("b1", "ok"),
                message("b2", "bad"),
                message("b3", "ok"),
            ])
            .await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes.len(), 3);
        let failed = report.outcomes.iter().find(|o| o.id == "b2").unwrap();
        assert!(!failed.success);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_timed_out_evicts_stale_entries() {
        let processor = processor(0, 5, 10);
        processor
            .in_flight
            .lock()
            .insert("stale".into(), Instant::now() - Duration::from_secs(60));
        processor
            .in_flight
            .lock()
            .insert("fresh".into(), Instant::now());

        assert_eq!(processor.cleanup_timed_out(), 1);
        assert_eq!(processor.in_flight_count(), 1);
    }
}
