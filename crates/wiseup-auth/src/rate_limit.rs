//! Fixed-window rate limiting over shared cache counters.
//!
//! Every key gets a minute, hour and day window. Counters live in the cache
//! tier manager so all instances see the same totals. Exceeding any window
//! locks the key for `lockout`.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};
use wiseup_cache::CacheTierManager;

use crate::config::RateLimitConfig;
use crate::error::{AuthError, AuthResult};

struct Window {
    tag: &'static str,
    span_secs: i64,
}

const WINDOWS: [Window; 3] = [
    Window {
        tag: "m",
        span_secs: 60,
    },
    Window {
        tag: "h",
        span_secs: 3600,
    },
    Window {
        tag: "d",
        span_secs: 86_400,
    },
];

pub struct RateLimiter {
    cache: Arc<CacheTierManager>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheTierManager>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    fn limit(&self, tag: &str) -> u32 {
        match tag {
            "m" => self.config.per_minute,
            "h" => self.config.per_hour,
            _ => self.config.per_day,
        }
    }

    /// Count one attempt against every key.
    ///
    /// # Errors
    ///
    /// `AuthError::RateLimited` when any key is locked out or goes over a
    /// window limit. Cache faults are logged and the attempt is allowed.
    pub async fn check(&self, keys: &[String]) -> AuthResult<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        for key in keys {
            if let Some(retry_after) = self.locked_for(key, now).await {
                return Err(AuthError::RateLimited { retry_after });
            }
        }

        for key in keys {
            for window in &WINDOWS {
                let idx = now / window.span_secs;
                let counter_key = format!("rl:{key}:{}:{idx}", window.tag);
                let ttl = Duration::from_secs(window.span_secs as u64);
                let count = match self.cache.increment(&counter_key, 1, ttl).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(key = %key, error = %e, "rate limit counter unavailable; allowing");
                        continue;
                    }
                };
                if count > i64::from(self.limit(window.tag)) {
                    debug!(key = %key, window = window.tag, count, "rate limit exceeded");
                    self.lock(key, now).await;
                    return Err(AuthError::RateLimited {
                        retry_after: self.config.lockout,
                    });
                }
            }
        }
        Ok(())
    }

    async fn locked_for(&self, key: &str, now: i64) -> Option<Duration> {
        let until = self.cache.get_counter(&lock_key(key)).await;
        (until > now).then(|| Duration::from_secs((until - now) as u64))
    }

    async fn lock(&self, key: &str, now: i64) {
        let until = now + self.config.lockout.as_secs() as i64;
        // Counter holds the unlock time in unix seconds; concurrent lockouts
        // keep the latest one.
        if let Err(e) = self
            .cache
            .raise_counter(&lock_key(key), until, self.config.lockout)
            .await
        {
            warn!(key = %key, error = %e, "failed to record lockout");
        }
    }
}

fn lock_key(key: &str) -> String {
    format!("rl:lock:{key}")
}
