pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;

pub use config::Config;
pub use error::{OpsError, Result};

// Re-export store seams
pub use store::{InMemoryStore, KeyValueStore};

// Re-export monitoring types
pub use monitoring::{
    monitoring_router, track_requests, Alert, AlertEngine, AlertStatus, HealthRegistry,
    HealthStatus, MetricKind, MetricRegistry, MonitoringService, Severity,
};

// Re-export cache types
pub use cache::{CacheKeyBuilder, CacheLock, CacheMonitoringAdapter, CacheService, CacheWarmer};

// Re-export queue types
pub use queue::{
    DeadLetterQueue, InMemoryQueueStore, JobQueue, Message, MessageProcessor, QueueManager,
    QueueMonitoringAdapter, QueueStore,
};

// Re-export pipeline types
pub use pipeline::{ErrorPolicy, Pipeline, Transform};
