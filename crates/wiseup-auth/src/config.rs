use std::time::Duration;

/// Token lifetimes and signing.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Absolute lifetime of a token family; rotation keeps the original expiry.
    pub refresh_ttl: Duration,
    pub access_ttl: Duration,
    /// HS256 secret for access tokens.
    pub jwt_secret: String,
    pub issuer: String,
    /// TTL of token and family lookups in the cache.
    pub lookup_cache_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: Duration::from_secs(30 * 24 * 3600),
            access_ttl: Duration::from_secs(15 * 60),
            jwt_secret: String::new(),
            issuer: "wiseup".to_string(),
            lookup_cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    /// How long a key stays blocked after exceeding a limit.
    pub lockout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 300,
            per_day: 2000,
            lockout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window: Duration,
    /// Attempts within the window before the failure rate is judged.
    pub min_attempts: u32,
    /// Failure fraction (0..=1) that raises an anomaly.
    pub failure_rate_threshold: f64,
    pub anomaly_ttl: Duration,
    /// Bounded queue between callers and the monitor task.
    pub queue_capacity: usize,
    /// Security events kept in memory; the oldest go first.
    pub security_event_capacity: usize,
    pub security_event_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            min_attempts: 10,
            failure_rate_threshold: 0.5,
            anomaly_ttl: Duration::from_secs(900),
            queue_capacity: 4096,
            security_event_capacity: 1000,
            security_event_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}
