pub mod key;
pub mod lock;
pub mod service;
pub mod warmer;

pub use key::CacheKeyBuilder;
pub use lock::CacheLock;
pub use service::{CacheService, CacheStats};
pub use warmer::{CacheMonitoringAdapter, CacheWarmer, WarmOptions, WarmTask};
