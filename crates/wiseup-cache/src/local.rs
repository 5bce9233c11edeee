//! Process-local tier.
//!
//! Sharded concurrent map: per-shard locking, never a single global lock, and
//! no suspension points. Expired entries stay readable as stale values until
//! the sweeper removes them past the grace period.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::entry::{CacheEntry, TierOrigin};
use crate::error::CacheError;

/// Entries inspected when choosing an eviction victim at capacity.
const EVICTION_SAMPLE: usize = 16;

pub(crate) struct LocalTier {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    next_version: AtomicU64,
}

impl LocalTier {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            next_version: AtomicU64::new(1),
        }
    }

    fn version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tier_origin: TierOrigin,
    ) -> u64 {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_one();
        }
        let version = self.version();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                tier_origin,
                expires_at: Instant::now() + ttl,
                version,
            },
        );
        version
    }

    /// Drop an expired entry if the sample has one, otherwise the entry
    /// closest to expiry.
    fn evict_one(&self) {
        let now = Instant::now();
        let victim = self
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .min_by_key(|e| if e.is_expired(now) { None } else { Some(e.expires_at) })
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            tracing::trace!(key = %key, "local cache evicted entry at capacity");
        }
    }

    pub(crate) fn get_fresh(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| Arc::clone(&e.value))
    }

    pub(crate) fn get_stale(&self, key: &str, grace: Duration) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_within_grace(now, grace))
            .map(|e| Arc::clone(&e.value))
    }

    pub(crate) fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Atomic add on a decimal counter. An expired or missing entry counts as
    /// zero and starts a new expiry; a live one keeps its expiry.
    pub(crate) fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let now = Instant::now();
        let version = self.version();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let current = parse_counter(&entry.value)?;
                let next = current.saturating_add(delta);
                entry.value = Arc::new(next.to_string().into_bytes());
                entry.version = version;
                Ok(next)
            }
            slot => {
                let entry = CacheEntry {
                    key: key.to_string(),
                    value: Arc::new(delta.to_string().into_bytes()),
                    tier_origin: TierOrigin::Local,
                    expires_at: now + ttl,
                    version,
                };
                match slot {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(entry);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(entry);
                    }
                }
                Ok(delta)
            }
        }
    }

    /// Raise a decimal counter to `value` unless a live entry already holds
    /// at least that much. The expiry restarts only when the value moves.
    pub(crate) fn raise(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, CacheError> {
        let now = Instant::now();
        let version = self.version();
        let entry = CacheEntry {
            key: key.to_string(),
            value: Arc::new(value.to_string().into_bytes()),
            tier_origin: TierOrigin::Local,
            expires_at: now + ttl,
            version,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let current = parse_counter(&occupied.get().value)?;
                if current >= value {
                    return Ok(current);
                }
                occupied.insert(entry);
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(value)
    }

    pub(crate) fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Remove entries expired for longer than `grace`.
    pub(crate) fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_within_grace(now, grace));
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) fn parse_counter(bytes: &[u8]) -> Result<i64, CacheError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| CacheError::Serialization("value is not a decimal counter".into()))
}
