//! # wiseup-cache
//!
//! Cache Tier Manager for the session core.
//!
//! - Process-local tier: sharded concurrent map, never suspends
//! - Distributed tier: Redis (or an in-process stand-in) shared by every
//!   instance, bounded by per-call timeouts and degraded on fault
//! - Authoritative store: reached only through loaders passed to
//!   [`CacheTierManager::get_or_load`], with stampede protection
//!
//! Invalidations are broadcast to peer instances over the fan-out channel;
//! [`RedisFanout`] provides that channel on top of Redis pub/sub.

mod config;
pub mod distributed;
mod entry;
mod error;
mod fanout_redis;
mod invalidation;
mod local;
mod manager;

pub use config::{CacheConfig, INVALIDATION_TOPIC};
pub use distributed::{
    DistributedTier, DistributedValue, DynDistributedTier, MemoryDistributedTier,
    RedisDistributedTier,
};
pub use entry::{CacheEntry, TierOrigin};
pub use error::CacheError;
pub use fanout_redis::RedisFanout;
pub use invalidation::InvalidationNotice;
pub use manager::{CacheHealth, CacheStats, CacheTierManager};

/// Build a Redis connection pool.
pub fn create_redis_pool(
    url: &str,
    pool_size: usize,
    timeout: std::time::Duration,
) -> Result<deadpool_redis::Pool, CacheError> {
    let mut cfg = deadpool_redis::Config::from_url(url);
    let mut pool_config = deadpool_redis::PoolConfig::new(pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    cfg.pool = Some(pool_config);
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::Unavailable(format!("failed to create Redis pool: {e}")))
}
