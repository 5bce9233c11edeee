use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use wiseup_core::BackoffPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub instance: InstanceConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub tokens: TokensConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub monitor: MonitorConfig,
    pub metrics: MetricsConfig,
    pub dashboard: DashboardConfig,
    pub alerts: AlertsConfig,
    pub identity: IdentityConfig,
}

impl AppConfig {
    pub fn addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.request_timeout_ms == 0 {
            return Err("server.request_timeout_ms must be > 0".into());
        }
        let level = self.logging.level.to_ascii_lowercase();
        let allowed = ["trace", "debug", "info", "warn", "error", "off"];
        if !allowed.contains(&level.as_str()) {
            return Err(format!(
                "logging.level must be one of {:?}, got '{}'",
                allowed, self.logging.level
            ));
        }
        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.url must be set when redis.enabled = true".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.cache.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        if self.cache.distributed_timeout_ms == 0 || self.cache.loader_timeout_ms == 0 {
            return Err("cache timeouts must be > 0".into());
        }
        if !self.tokens.jwt_secret.is_empty() && self.tokens.jwt_secret.len() < 32 {
            return Err("tokens.jwt_secret must be at least 32 bytes".into());
        }
        if self.tokens.access_ttl_secs == 0 {
            return Err("tokens.access_ttl_secs must be > 0".into());
        }
        if self.tokens.refresh_ttl_secs <= self.tokens.access_ttl_secs {
            return Err("tokens.refresh_ttl_secs must be greater than tokens.access_ttl_secs".into());
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 || self.rate_limit.per_day == 0 {
            return Err("rate_limit windows must allow at least one attempt".into());
        }
        if self.batch.max_batch_size == 0 || self.batch.flush_concurrency == 0 {
            return Err("batch.max_batch_size and batch.flush_concurrency must be > 0".into());
        }
        if self.batch.max_pending < self.batch.flush_threshold {
            return Err("batch.max_pending must be >= batch.flush_threshold".into());
        }
        if self.batch.flush_interval_ms == 0 {
            return Err("batch.flush_interval_ms must be > 0".into());
        }
        if !(self.monitor.failure_rate_threshold > 0.0 && self.monitor.failure_rate_threshold <= 1.0) {
            return Err("monitor.failure_rate_threshold must be in (0, 1]".into());
        }
        if self.monitor.window_secs == 0 || self.monitor.queue_capacity == 0 {
            return Err("monitor.window_secs and monitor.queue_capacity must be > 0".into());
        }
        if self.metrics.window_secs == 0 || self.metrics.window_count == 0 {
            return Err("metrics.window_secs and metrics.window_count must be > 0".into());
        }
        if self.dashboard.publish_interval_ms == 0 || self.dashboard.observer_buffer == 0 {
            return Err("dashboard.publish_interval_ms and dashboard.observer_buffer must be > 0".into());
        }
        if self.dashboard.liveness_timeout_ms <= self.dashboard.ping_interval_ms {
            return Err("dashboard.liveness_timeout_ms must exceed dashboard.ping_interval_ms".into());
        }
        if let Some(user) = self
            .identity
            .users
            .iter()
            .find(|u| u.username.is_empty() || u.user_id.is_empty())
        {
            return Err(format!(
                "identity.users entries need a username and user_id (got '{}')",
                user.username
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_body_limit_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Identity of this process among its peers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Stable instance id; a random one is generated when unset.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
    /// Prefix for every key written to the distributed tier.
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}
fn default_redis_pool_size() -> usize {
    10
}
fn default_redis_timeout_ms() -> u64 {
    5000
}
fn default_redis_key_prefix() -> String {
    "wiseup:".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
    #[serde(default = "default_distributed_timeout_ms")]
    pub distributed_timeout_ms: u64,
    #[serde(default = "default_degraded_ttl_secs")]
    pub degraded_ttl_secs: u64,
    #[serde(default = "default_degraded_retry_ms")]
    pub degraded_retry_ms: u64,
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    #[serde(default = "default_loader_timeout_ms")]
    pub loader_timeout_ms: u64,
    #[serde(default = "default_loader_max_attempts")]
    pub loader_max_attempts: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            local_max_entries: default_local_max_entries(),
            distributed_timeout_ms: default_distributed_timeout_ms(),
            degraded_ttl_secs: default_degraded_ttl_secs(),
            degraded_retry_ms: default_degraded_retry_ms(),
            stale_grace_secs: default_stale_grace_secs(),
            loader_timeout_ms: default_loader_timeout_ms(),
            loader_max_attempts: default_loader_max_attempts(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_local_max_entries() -> usize {
    100_000
}
fn default_distributed_timeout_ms() -> u64 {
    250
}
fn default_degraded_ttl_secs() -> u64 {
    5
}
fn default_degraded_retry_ms() -> u64 {
    5000
}
fn default_stale_grace_secs() -> u64 {
    30
}
fn default_loader_timeout_ms() -> u64 {
    2000
}
fn default_loader_max_attempts() -> u32 {
    3
}
fn default_sweep_interval_secs() -> u64 {
    30
}

impl From<&CacheConfig> for wiseup_cache::CacheConfig {
    fn from(cfg: &CacheConfig) -> Self {
        let defaults = wiseup_cache::CacheConfig::default();
        Self {
            default_ttl: Duration::from_secs(cfg.default_ttl_secs),
            local_max_entries: cfg.local_max_entries,
            distributed_timeout: Duration::from_millis(cfg.distributed_timeout_ms),
            degraded_ttl: Duration::from_secs(cfg.degraded_ttl_secs),
            degraded_retry: Duration::from_millis(cfg.degraded_retry_ms),
            stale_grace: Duration::from_secs(cfg.stale_grace_secs),
            loader_timeout: Duration::from_millis(cfg.loader_timeout_ms),
            loader_backoff: BackoffPolicy::new(
                Duration::from_millis(50),
                Duration::from_secs(1),
                cfg.loader_max_attempts,
            ),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_access_ttl_secs")]
    pub access_ttl_secs: u64,
    /// HS256 secret for access tokens. Every instance of a fleet must share
    /// it; an ephemeral secret is generated when empty.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_lookup_cache_ttl_secs")]
    pub lookup_cache_ttl_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_secs: default_refresh_ttl_secs(),
            access_ttl_secs: default_access_ttl_secs(),
            jwt_secret: String::new(),
            issuer: default_issuer(),
            lookup_cache_ttl_secs: default_lookup_cache_ttl_secs(),
        }
    }
}

fn default_refresh_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_access_ttl_secs() -> u64 {
    15 * 60
}
fn default_issuer() -> String {
    "wiseup".into()
}
fn default_lookup_cache_ttl_secs() -> u64 {
    300
}

impl From<&TokensConfig> for wiseup_auth::TokenConfig {
    fn from(cfg: &TokensConfig) -> Self {
        Self {
            refresh_ttl: Duration::from_secs(cfg.refresh_ttl_secs),
            access_ttl: Duration::from_secs(cfg.access_ttl_secs),
            jwt_secret: cfg.jwt_secret.clone(),
            issuer: cfg.issuer.clone(),
            lookup_cache_ttl: Duration::from_secs(cfg.lookup_cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

fn default_per_minute() -> u32 {
    30
}
fn default_per_hour() -> u32 {
    300
}
fn default_per_day() -> u32 {
    2000
}
fn default_lockout_secs() -> u64 {
    300
}

impl From<&RateLimitConfig> for wiseup_auth::RateLimitConfig {
    fn from(cfg: &RateLimitConfig) -> Self {
        Self {
            per_minute: cfg.per_minute,
            per_hour: cfg.per_hour,
            per_day: cfg.per_day,
            lockout: Duration::from_secs(cfg.lockout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_flush_concurrency")]
    pub flush_concurrency: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_batch_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Append-only journal file; the journal is kept in memory when unset.
    #[serde(default)]
    pub journal_path: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            flush_threshold: default_flush_threshold(),
            max_batch_size: default_max_batch_size(),
            max_pending: default_max_pending(),
            flush_concurrency: default_flush_concurrency(),
            store_timeout_ms: default_store_timeout_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            cache_ttl_secs: default_batch_cache_ttl_secs(),
            journal_path: None,
        }
    }
}

fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_flush_threshold() -> usize {
    500
}
fn default_max_batch_size() -> usize {
    256
}
fn default_max_pending() -> usize {
    10_000
}
fn default_flush_concurrency() -> usize {
    8
}
fn default_store_timeout_ms() -> u64 {
    2000
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_retry_max_ms() -> u64 {
    5000
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_batch_cache_ttl_secs() -> u64 {
    60
}

impl From<&BatchConfig> for wiseup_batch::BatchConfig {
    fn from(cfg: &BatchConfig) -> Self {
        Self {
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            flush_threshold: cfg.flush_threshold,
            max_batch_size: cfg.max_batch_size,
            max_pending: cfg.max_pending,
            flush_concurrency: cfg.flush_concurrency,
            store_timeout: Duration::from_millis(cfg.store_timeout_ms),
            retry: BackoffPolicy::new(
                Duration::from_millis(cfg.retry_base_ms),
                Duration::from_millis(cfg.retry_max_ms),
                cfg.retry_max_attempts,
            ),
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            ..wiseup_batch::BatchConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_min_attempts")]
    pub min_attempts: u32,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_anomaly_ttl_secs")]
    pub anomaly_ttl_secs: u64,
    #[serde(default = "default_monitor_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_security_event_capacity")]
    pub security_event_capacity: usize,
    #[serde(default = "default_security_event_retention_days")]
    pub security_event_retention_days: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_monitor_window_secs(),
            min_attempts: default_min_attempts(),
            failure_rate_threshold: default_failure_rate_threshold(),
            anomaly_ttl_secs: default_anomaly_ttl_secs(),
            queue_capacity: default_monitor_queue_capacity(),
            security_event_capacity: default_security_event_capacity(),
            security_event_retention_days: default_security_event_retention_days(),
        }
    }
}

fn default_monitor_window_secs() -> u64 {
    300
}
fn default_min_attempts() -> u32 {
    10
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_anomaly_ttl_secs() -> u64 {
    900
}
fn default_monitor_queue_capacity() -> usize {
    4096
}
fn default_security_event_capacity() -> usize {
    1000
}
fn default_security_event_retention_days() -> u64 {
    30
}

impl From<&MonitorConfig> for wiseup_auth::MonitorConfig {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs),
            min_attempts: cfg.min_attempts,
            failure_rate_threshold: cfg.failure_rate_threshold,
            anomaly_ttl: Duration::from_secs(cfg.anomaly_ttl_secs),
            queue_capacity: cfg.queue_capacity,
            security_event_capacity: cfg.security_event_capacity,
            security_event_retention: Duration::from_secs(
                cfg.security_event_retention_days * 24 * 3600,
            ),
        }
    }
}

/// Rolling window of the metrics aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_metrics_window_count")]
    pub window_count: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_metrics_window_secs(),
            window_count: default_metrics_window_count(),
        }
    }
}

fn default_metrics_window_secs() -> u64 {
    10
}
fn default_metrics_window_count() -> usize {
    6
}

impl From<&MetricsConfig> for wiseup_telemetry::AggregatorConfig {
    fn from(cfg: &MetricsConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs),
            window_count: cfg.window_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    #[serde(default = "default_peer_ttl_ms")]
    pub peer_ttl_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: default_publish_interval_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            peer_ttl_ms: default_peer_ttl_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

fn default_publish_interval_ms() -> u64 {
    5000
}
fn default_snapshot_timeout_ms() -> u64 {
    2000
}
fn default_peer_ttl_ms() -> u64 {
    30_000
}
fn default_ping_interval_ms() -> u64 {
    15_000
}
fn default_liveness_timeout_ms() -> u64 {
    45_000
}
fn default_observer_buffer() -> usize {
    16
}

impl From<&DashboardConfig> for wiseup_telemetry::DashboardConfig {
    fn from(cfg: &DashboardConfig) -> Self {
        Self {
            publish_interval: Duration::from_millis(cfg.publish_interval_ms),
            snapshot_timeout: Duration::from_millis(cfg.snapshot_timeout_ms),
            peer_ttl: Duration::from_millis(cfg.peer_ttl_ms),
            ping_interval: Duration::from_millis(cfg.ping_interval_ms),
            liveness_timeout: Duration::from_millis(cfg.liveness_timeout_ms),
            observer_buffer: cfg.observer_buffer,
            ..wiseup_telemetry::DashboardConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_cache_miss_ratio")]
    pub cache_miss_ratio: f64,
    #[serde(default = "default_rotation_error_ratio")]
    pub rotation_error_ratio: f64,
    #[serde(default = "default_rotation_p95_ms")]
    pub rotation_p95_ms: f64,
    #[serde(default = "default_auth_failures")]
    pub auth_failures: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: f64,
    /// Webhook receiving alert notifications as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cache_miss_ratio: default_cache_miss_ratio(),
            rotation_error_ratio: default_rotation_error_ratio(),
            rotation_p95_ms: default_rotation_p95_ms(),
            auth_failures: default_auth_failures(),
            min_samples: default_min_samples(),
            webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

fn default_cache_miss_ratio() -> f64 {
    0.2
}
fn default_rotation_error_ratio() -> f64 {
    0.05
}
fn default_rotation_p95_ms() -> f64 {
    2000.0
}
fn default_auth_failures() -> f64 {
    10.0
}
fn default_min_samples() -> f64 {
    20.0
}
fn default_webhook_timeout_ms() -> u64 {
    3000
}

impl From<&AlertsConfig> for wiseup_telemetry::hub::AlertThresholds {
    fn from(cfg: &AlertsConfig) -> Self {
        Self {
            cache_miss_ratio: cfg.cache_miss_ratio,
            rotation_error_ratio: cfg.rotation_error_ratio,
            rotation_p95_ms: cfg.rotation_p95_ms,
            auth_failures: cfg.auth_failures,
            min_samples: cfg.min_samples,
        }
    }
}

/// Users of the built-in identity authority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub users: Vec<LocalUserConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LocalUserConfig {
    pub username: String,
    pub user_id: String,
    pub password: String,
}

impl std::fmt::Debug for LocalUserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalUserConfig")
            .field("username", &self.username)
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "wiseup.toml";

    /// Load configuration from an optional TOML file, then `WISEUP__SECTION__KEY`
    /// environment overrides, and validate the result.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();

        let path = path.unwrap_or(DEFAULT_CONFIG_PATH);
        let pathbuf = PathBuf::from(path);
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }

        builder = builder.add_source(
            Environment::with_prefix("WISEUP")
                .try_parsing(true)
                .separator("__"),
        );

        let cfg = builder.build().map_err(|e| e.to_string())?;
        let app: AppConfig = cfg.try_deserialize().map_err(|e| e.to_string())?;
        app.validate()?;
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.addr().port(), 8080);
        assert!(!cfg.redis.enabled);
    }

    #[test]
    fn test_rejects_short_jwt_secret() {
        let mut cfg = AppConfig::default();
        cfg.tokens.jwt_secret = "short".into();
        assert!(cfg.validate().unwrap_err().contains("jwt_secret"));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.monitor.failure_rate_threshold = 1.5;
        assert!(cfg.validate().is_err());
        cfg.monitor.failure_rate_threshold = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_runtime_conversions_keep_units() {
        let cfg = AppConfig::default();
        let cache: wiseup_cache::CacheConfig = (&cfg.cache).into();
        assert_eq!(cache.distributed_timeout, Duration::from_millis(250));
        let batch: wiseup_batch::BatchConfig = (&cfg.batch).into();
        assert_eq!(batch.flush_interval, Duration::from_secs(1));
        assert_eq!(batch.retry.max_attempts, 5);
        let dashboard: wiseup_telemetry::DashboardConfig = (&cfg.dashboard).into();
        assert_eq!(dashboard.liveness_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_user_password_is_redacted() {
        let user = LocalUserConfig {
            username: "alice".into(),
            user_id: "u-1".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{user:?}").contains("hunter2"));
    }
}
