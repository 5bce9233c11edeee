use std::time::Duration;
use wiseup_core::BackoffPolicy;

pub const DEAD_LETTER_TABLE: &str = "dead_letter";

/// Cache prefix for values derived from a whole table, such as totals or
/// listings. Each flush cycle that writes to `table` drops them. Row entries
/// (`table/key`) are kept consistent separately.
pub fn table_view_prefix(table: &str) -> String {
    format!("{table}:")
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush timer period.
    pub flush_interval: Duration,
    /// Pending mutations that trigger a flush before the timer fires.
    pub flush_threshold: usize,
    /// Most mutations taken from one partition per flush.
    pub max_batch_size: usize,
    /// Enqueue waits for capacity beyond this many pending mutations.
    pub max_pending: usize,
    /// Partitions flushed in parallel.
    pub flush_concurrency: usize,
    /// Upper bound for one store call.
    pub store_timeout: Duration,
    pub retry: BackoffPolicy,
    pub dead_letter_table: String,
    /// TTL for values written through to the cache at enqueue.
    pub cache_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_threshold: 500,
            max_batch_size: 256,
            max_pending: 10_000,
            flush_concurrency: 8,
            store_timeout: Duration::from_secs(2),
            retry: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 5),
            dead_letter_table: DEAD_LETTER_TABLE.to_string(),
            cache_ttl: Duration::from_secs(60),
        }
    }
}
