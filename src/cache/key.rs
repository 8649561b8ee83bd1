//! Structured cache keys.
//!
//! Every cached value lives under `{prefix}:{entity}:{operation}:{identifier}:{version}`.
//! Segments may only contain `[A-Za-z0-9_-]`; an empty or malformed segment
//! is a validation error, caught before anything touches the store.

use crate::error::{OpsError, Result};

#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    prefix: String,
    version: String,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new("rdp", "v1")
    }
}

impl CacheKeyBuilder {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn build(&self, entity: &str, operation: &str, identifier: &str) -> Result<String> {
        for (field, value) in [
            ("prefix", self.prefix.as_str()),
            ("entity", entity),
            ("operation", operation),
            ("identifier", identifier),
            ("version", self.version.as_str()),
        ] {
            validate_segment(field, value)?;
        }
        Ok(format!(
            "{}:{}:{}:{}:{}",
            self.prefix, entity, operation, identifier, self.version
        ))
    }

    /// Lock key guarding a cache key against stampedes.
    pub fn lock_key(cache_key: &str) -> String {
        format!("lock:{cache_key}")
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(OpsError::Validation(format!(
            "cache key {field} must not be empty"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(OpsError::Validation(format!(
            "cache key {field} contains invalid characters: {value:?}"
        )));
    }
    Ok(())
}
