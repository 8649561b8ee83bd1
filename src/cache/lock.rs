//! Distributed lock over the key-value store.
//!
//! Acquisition is a single atomic set-if-absent with an expiry; the TTL is
//! the only safety net against a holder dying, so there is no fencing token.
//! Callers must tolerate spurious contention and either back off or fall
//! through.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::cache::key::CacheKeyBuilder;
use crate::error::Result;
use crate::store::KeyValueStore;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CacheLock {
    store: Arc<dyn KeyValueStore>,
}

impl CacheLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock for `cache_key`. Returns whether we now hold it.
    pub async fn acquire(&self, cache_key: &str, ttl: Duration) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(&CacheKeyBuilder::lock_key(cache_key), &token, ttl)
            .await?;
        if acquired {
            debug!("acquired lock for {}", cache_key);
        }
        Ok(acquired)
    }

    /// Unconditional release.
    pub async fn release(&self, cache_key: &str) -> Result<()> {
        self.store
            .delete(&CacheKeyBuilder::lock_key(cache_key))
            .await?;
        debug!("released lock for {}", cache_key);
        Ok(())
    }
}
