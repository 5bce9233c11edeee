use std::time::Duration;
use wiseup_core::BackoffPolicy;

pub const INVALIDATION_TOPIC: &str = "cache:invalidate";

/// Tuning for [`CacheTierManager`](crate::CacheTierManager).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when the distributed tier reports a value without expiry.
    pub default_ttl: Duration,
    pub local_max_entries: usize,
    /// Upper bound for every distributed tier call.
    pub distributed_timeout: Duration,
    /// Local TTL cap while the distributed tier is degraded.
    pub degraded_ttl: Duration,
    /// How long the distributed tier is skipped after a fault before it is
    /// tried again.
    pub degraded_retry: Duration,
    /// How long past expiry a local entry may be served when a load fails.
    pub stale_grace: Duration,
    /// Upper bound for one loader attempt.
    pub loader_timeout: Duration,
    pub loader_backoff: BackoffPolicy,
    pub sweep_interval: Duration,
    pub invalidation_topic: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            local_max_entries: 100_000,
            distributed_timeout: Duration::from_millis(250),
            degraded_ttl: Duration::from_secs(5),
            degraded_retry: Duration::from_secs(5),
            stale_grace: Duration::from_secs(30),
            loader_timeout: Duration::from_secs(2),
            loader_backoff: BackoffPolicy::default(),
            sweep_interval: Duration::from_secs(30),
            invalidation_topic: INVALIDATION_TOPIC.to_string(),
        }
    }
}
