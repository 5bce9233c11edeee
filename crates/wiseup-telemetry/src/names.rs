//! Metric names as constants for consistency.

// Cache tier manager
pub const CACHE_LOOKUPS_TOTAL: &str = "cache_lookups_total";
pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
pub const CACHE_LOADS_TOTAL: &str = "cache_loads_total";
pub const CACHE_LOAD_FAILURES_TOTAL: &str = "cache_load_failures_total";
pub const CACHE_COLLAPSED_LOADS_TOTAL: &str = "cache_collapsed_loads_total";
pub const CACHE_STALE_SERVED_TOTAL: &str = "cache_stale_served_total";
pub const CACHE_INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";
pub const CACHE_DISTRIBUTED_FAULTS_TOTAL: &str = "cache_distributed_faults_total";
pub const CACHE_DEGRADED: &str = "cache_degraded";
pub const CACHE_LOCAL_ENTRIES: &str = "cache_local_entries";
pub const CACHE_LOAD_DURATION_MS: &str = "cache_load_duration_ms";

// Token lifecycle service
pub const TOKEN_ISSUED_TOTAL: &str = "token_issued_total";
pub const TOKEN_ROTATION_ATTEMPTS_TOTAL: &str = "token_rotation_attempts_total";
pub const TOKEN_ROTATIONS_TOTAL: &str = "token_rotations_total";
pub const TOKEN_ROTATION_FAILURES_TOTAL: &str = "token_rotation_failures_total";
pub const TOKEN_REUSE_DETECTED_TOTAL: &str = "token_reuse_detected_total";
pub const TOKEN_RATE_LIMITED_TOTAL: &str = "token_rate_limited_total";
pub const TOKEN_REVOCATIONS_TOTAL: &str = "token_revocations_total";
pub const TOKEN_ROTATION_DURATION_MS: &str = "token_rotation_duration_ms";

// Batch writer
pub const BATCH_ENQUEUED_TOTAL: &str = "batch_enqueued_total";
pub const BATCH_FLUSHED_TOTAL: &str = "batch_flushed_total";
pub const BATCH_FLUSH_RETRIES_TOTAL: &str = "batch_flush_retries_total";
pub const BATCH_DEAD_LETTERS_TOTAL: &str = "batch_dead_letters_total";
pub const BATCH_PENDING: &str = "batch_pending";
pub const BATCH_FLUSH_DURATION_MS: &str = "batch_flush_duration_ms";

// Auth monitor
pub const AUTH_ATTEMPTS_TOTAL: &str = "auth_attempts_total";
pub const AUTH_MONITOR_DROPPED_TOTAL: &str = "auth_monitor_dropped_total";
pub const AUTH_ANOMALIES_TOTAL: &str = "auth_anomalies_total";
pub const AUTH_ACTIVE_ANOMALIES: &str = "auth_active_anomalies";

// Observability hub
pub const SPAN_DURATION_MS: &str = "span_duration_ms";
pub const SPANS_TOTAL: &str = "spans_total";
pub const HUB_EVENTS_TOTAL: &str = "hub_events_total";
pub const ALERTS_FIRED_TOTAL: &str = "alerts_fired_total";

// Dashboard broadcaster
pub const DASHBOARD_OBSERVERS: &str = "dashboard_observers";
pub const DASHBOARD_PUBLISHED_TOTAL: &str = "dashboard_published_total";
pub const DASHBOARD_STALE_SNAPSHOTS_TOTAL: &str = "dashboard_stale_snapshots_total";
pub const DASHBOARD_EVICTIONS_TOTAL: &str = "dashboard_evictions_total";
pub const DASHBOARD_PEERS: &str = "dashboard_peers";
