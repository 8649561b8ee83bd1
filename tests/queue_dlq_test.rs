//! Queue layer scenarios: processor backoff, dead-letter bounded retry,
//! and the consume-fail-park-retry path end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opscore::config::QueueConfig;
use opscore::error::OpsError;
use opscore::queue::{
    DeadLetterQueue, InMemoryQueueStore, JobOptions, Message, MessageProcessor, QueueManager,
    RetryFilters,
};

fn setup() -> (Arc<QueueManager>, Arc<DeadLetterQueue>) {
    let manager = QueueManager::new(Arc::new(InMemoryQueueStore::new()));
    let dlq = DeadLetterQueue::new(manager.clone(), &QueueConfig::default(), true);
    (manager, dlq)
}

fn message(id: &str, queue: &str) -> Message {
    Message {
        id: id.to_string(),
        message_type: "order".to_string(),
        data: serde_json::json!({"total": 5}),
        attempts: 0,
        source_queue: Some(queue.to_string()),
    }
}

/// After the retry budget is spent, retry_message refuses and nothing
/// further is enqueued onto the target queue.
#[tokio::test]
async fn test_dlq_retry_cap() {
    let (manager, dlq) = setup();
    dlq.add_failed_message(&message("m1", "orders"), "boom")
        .await
        .unwrap();

    for i in 1..=3 {
        assert!(dlq.retry_message("m1").await.unwrap(), "retry {i}");
    }
    assert!(!dlq.retry_message("m1").await.unwrap());

    let counts = manager.queue("orders").status().await.unwrap();
    assert_eq!(counts.waiting, 3);
}

/// Two failures then success resolves with the handler having run three
/// times and at least 100 + 200 ms of backoff elapsed.
#[tokio::test]
async fn test_processor_backoff_timing() {
    let processor = MessageProcessor::new(&QueueConfig {
        max_retries: 3,
        retry_delay_ms: 100,
        ..Default::default()
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    processor
        .register_handler(
            "t",
            Arc::new(move |_| {
                let calls = handler_calls.clone();
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OpsError::Transient("not yet".into()))
                    } else {
                        Ok(serde_json::json!("ok"))
                    }
                })
            }),
        )
        .unwrap();

    let start = Instant::now();
    let result = processor
        .process(Message {
            id: "j1".to_string(),
            message_type: "t".to_string(),
            data: serde_json::json!({}),
            attempts: 0,
            source_queue: None,
        })
        .await
        .unwrap();

    assert_eq!(result, serde_json::json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

/// A message that exhausts its retries lands in the dead-letter queue with
/// its context, and a manual retry re-enqueues it onto the original queue.
#[tokio::test]
async fn test_failed_message_parks_and_retries() {
    let (manager, dlq) = setup();
    let processor = MessageProcessor::new(&QueueConfig {
        max_retries: 1,
        retry_delay_ms: 5,
        ..Default::default()
    });
    processor.set_dead_letter_queue(dlq.clone());
    processor
        .register_handler(
            "order",
            Arc::new(|_| Box::pin(async { Err(OpsError::Transient("db offline".into())) })),
        )
        .unwrap();

    let err = processor.process(message("m9", "orders")).await.unwrap_err();
    assert!(matches!(err, OpsError::Transient(_)));

    let record = dlq.get_record("m9").await.unwrap().unwrap();
    assert_eq!(record.context.original_queue, "orders");
    assert_eq!(record.context.attempts, 1);
    assert!(record.error.message.contains("db offline"));
    assert_eq!(dlq.total().await.unwrap(), 1);

    assert!(dlq.retry_message("m9").await.unwrap());
    let counts = manager.queue("orders").status().await.unwrap();
    assert_eq!(counts.waiting, 1);
}

/// Queue consumption drains jobs through a processor with the configured
/// concurrency, and failed jobs retry with their own backoff before ending
/// up failed.
#[tokio::test]
async fn test_queue_consumption_lifecycle() {
    let manager = QueueManager::new(Arc::new(InMemoryQueueStore::new()));
    let queue = manager.queue("work");
    let processed = Arc::new(AtomicUsize::new(0));

    let counter = processed.clone();
    queue.set_processor(
        Arc::new(move |job| {
            let counter = counter.clone();
            Box::pin(async move {
                if job.data["fail"] == serde_json::json!(true) {
                    Err(OpsError::Transient("bad job".into()))
                } else {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!("done"))
                }
            })
        }),
        2,
    );

    for _ in 0..4 {
        queue
            .add(serde_json::json!({"fail": false}), JobOptions::default())
            .await
            .unwrap();
    }
    queue
        .add(
            serde_json::json!({"fail": true}),
            JobOptions {
                attempts: 2,
                backoff_base: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(processed.load(Ordering::SeqCst), 4);
    let counts = queue.status().await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 0);
    queue.close();
}

/// Batch retry walks every parked record and reports the split.
#[tokio::test]
async fn test_dlq_batch_retry_report() {
    let (_, dlq) = setup();
    for id in ["a", "b", "c"] {
        dlq.add_failed_message(&message(id, "orders"), "x")
            .await
            .unwrap();
    }
    // Spend one record's budget entirely.
    for _ in 0..3 {
        dlq.retry_message("c").await.unwrap();
    }

    let report = dlq.retry_batch(&RetryFilters::default()).await.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);
}
