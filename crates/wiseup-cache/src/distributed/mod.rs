//! Shared distributed tier.

mod memory;
mod redis_tier;

pub use self::memory::MemoryDistributedTier;
pub use self::redis_tier::RedisDistributedTier;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;

/// A value read from the distributed tier together with its remaining TTL,
/// so promotion into the local tier never outlives the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedValue {
    pub value: Vec<u8>,
    /// `None` when the backend reports no expiry.
    pub ttl_remaining: Option<Duration>,
}

/// Cache shared by every server instance. All calls must be idempotent; the
/// manager bounds each one with a timeout.
#[async_trait]
pub trait DistributedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DistributedValue>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Add `delta` to a decimal counter, setting `ttl` when the counter is new.
    /// The add and the expiry are one atomic step.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Raise a decimal counter to `value` unless it already holds at least
    /// that much, in one atomic step. `ttl` restarts only when the value
    /// moves. Returns the counter after the call.
    async fn raise(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Delete every key that starts with `prefix`; returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

pub type DynDistributedTier = Arc<dyn DistributedTier>;
