use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opscore::cache::{CacheMonitoringAdapter, CacheService, CacheWarmer};
use opscore::monitoring::{monitoring_router, track_requests, MonitoringService};
use opscore::queue::{DeadLetterQueue, InMemoryQueueStore, MessageProcessor, QueueManager, QueueMonitoringAdapter};
use opscore::store::InMemoryStore;
use opscore::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,opscore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Stores backing the cache and queue layers.
    let kv_store = Arc::new(InMemoryStore::new());
    let queue_store = Arc::new(InMemoryQueueStore::new());

    // Cache layer.
    let cache = Arc::new(CacheService::new(kv_store.clone(), &config.cache));
    let warmer = Arc::new(CacheWarmer::new(cache.clone(), &config.cache));
    {
        let warmer = warmer.clone();
        cache.set_access_listener(Arc::new(move |key, hit| warmer.record_access(key, hit)));
    }
    let warm_report = warmer.warm_on_startup().await;
    info!(
        "startup warm-up: {} ok, {} failed in {}ms",
        warm_report.successful.len(),
        warm_report.failed.len(),
        warm_report.elapsed_ms
    );
    warmer.start_scheduled();

    // Queue layer.
    let queue_manager = QueueManager::new(queue_store);
    let dead_letter = DeadLetterQueue::new(queue_manager.clone(), &config.queue, config.test_mode);
    let processor = Arc::new(MessageProcessor::new(&config.queue));
    processor.set_dead_letter_queue(dead_letter.clone());

    // Monitoring façade wiring all three domains into the metric registry.
    let monitoring = MonitoringService::new(config.monitoring.clone());
    monitoring.register_key_value_store(kv_store);
    monitoring.register_queue_system(Arc::new(QueueMonitoringAdapter::new(queue_manager.clone())));
    monitoring.register_cache_service(Arc::new(CacheMonitoringAdapter::new(
        cache.clone(),
        warmer.clone(),
    )));

    let app = Router::new()
        .merge(monitoring_router(monitoring.clone()))
        .layer(axum::middleware::from_fn_with_state(
            monitoring.clone(),
            track_requests,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("serving admin surface on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    warmer.stop_scheduled();
    dead_letter.stop();
    queue_manager.close_all();
    monitoring.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
