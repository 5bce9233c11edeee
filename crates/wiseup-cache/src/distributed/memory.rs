//! In-process stand-in for the distributed tier.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::{DistributedTier, DistributedValue};
use crate::error::CacheError;
use crate::local::parse_counter;

#[derive(Default)]
struct Shared {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    gets: AtomicU64,
}

/// Clones share one keyspace, so several managers in one process see the
/// same "remote" cache. Availability and latency can be toggled to simulate
/// partitions and slow networks.
#[derive(Clone)]
pub struct MemoryDistributedTier {
    shared: Arc<Shared>,
}

impl MemoryDistributedTier {
    pub fn new() -> Self {
        let shared = Shared::default();
        shared.available.store(true, Ordering::SeqCst);
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Whether a live value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shared
            .entries
            .get(key)
            .is_some_and(|e| e.1 > now)
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> u64 {
        self.shared.gets.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), CacheError> {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory tier partitioned".into()));
        }
        Ok(())
    }
}

impl Default for MemoryDistributedTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedTier for MemoryDistributedTier {
    async fn get(&self, key: &str) -> Result<Option<DistributedValue>, CacheError> {
        self.check().await?;
        self.shared.gets.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        Ok(self
            .shared
            .entries
            .get(key)
            .filter(|e| e.1 > now)
            .map(|e| DistributedValue {
                value: e.0.clone(),
                ttl_remaining: Some(e.1.saturating_duration_since(now)),
            }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check().await?;
        self.shared
            .entries
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check().await?;
        self.shared.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        self.check().await?;
        let now = Instant::now();
        match self.shared.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().1 > now => {
                let next = parse_counter(&occupied.get().0)?.saturating_add(delta);
                occupied.get_mut().0 = next.to_string().into_bytes();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert((delta.to_string().into_bytes(), now + ttl));
                Ok(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((delta.to_string().into_bytes(), now + ttl));
                Ok(delta)
            }
        }
    }

    async fn raise(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, CacheError> {
        self.check().await?;
        let now = Instant::now();
        let fresh = (value.to_string().into_bytes(), now + ttl);
        match self.shared.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().1 > now => {
                let current = parse_counter(&occupied.get().0)?;
                if current >= value {
                    return Ok(current);
                }
                occupied.insert(fresh);
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(value)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.check().await?;
        let before = self.shared.entries.len();
        self.shared.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.shared.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check().await
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
