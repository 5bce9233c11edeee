//! Cache errors.

use wiseup_storage::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Distributed tier fault. Callers never see this from reads; the manager
    /// degrades to local-only operation instead.
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),

    /// The authoritative store failed on a miss and no value within the stale
    /// grace period was available.
    #[error("load failed for '{key}': {source}")]
    LoadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("cache call timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    #[must_use]
    pub fn load_failed(key: impl Into<String>, source: StoreError) -> Self {
        Self::LoadFailed {
            key: key.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::LoadFailed { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
