//! Cache Tier Manager: process-local tier, shared distributed tier, and
//! read-through loads from the authoritative store.
//!
//! ## Lookup order
//!
//! 1. Local tier (never suspends)
//! 2. Distributed tier, bounded by `distributed_timeout`; hits are promoted to
//!    the local tier with the remaining TTL reported by the distributed tier
//! 3. Miss, or for [`CacheTierManager::get_or_load`], a single collapsed load
//!
//! ## Degraded mode
//!
//! Any distributed fault opens a small circuit: the tier is skipped for
//! `degraded_retry`, local TTLs are capped at `degraded_ttl`, and keys
//! invalidated or written meanwhile are remembered, as are invalidated
//! prefixes. The next recovery check replays those deletes before the tier is read
//! again.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiseup_core::{DynFanout, InstanceId, retry_with_backoff};
use wiseup_storage::StoreError;
use wiseup_telemetry::MetricsAggregator;
use wiseup_telemetry::names::*;

use crate::config::CacheConfig;
use crate::distributed::DynDistributedTier;
use crate::entry::{CacheEntry, TierOrigin};
use crate::error::CacheError;
use crate::invalidation::InvalidationNotice;
use crate::local::{LocalTier, parse_counter};

type LoadResult = Result<Option<Arc<Vec<u8>>>, CacheError>;
type LoadCell = Arc<OnceCell<LoadResult>>;

/// A distributed delete that could not be applied while degraded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingDelete {
    Key(String),
    Prefix(String),
}

impl PendingDelete {
    fn as_str(&self) -> &str {
        match self {
            Self::Key(key) | Self::Prefix(key) => key,
        }
    }
}

#[derive(Default)]
struct DegradedState {
    until: Option<Instant>,
    pending: HashSet<PendingDelete>,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    collapsed_loads: AtomicU64,
    stale_served: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub local_entries: usize,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub collapsed_loads: u64,
    pub stale_served: u64,
    pub invalidations: u64,
    pub degraded: bool,
    pub pending_invalidations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    /// `"local"` when no distributed tier is configured.
    pub backend: &'static str,
    pub degraded: bool,
    pub local_entries: usize,
    pub pending_invalidations: usize,
}

pub struct CacheTierManager {
    instance_id: InstanceId,
    config: CacheConfig,
    local: LocalTier,
    distributed: Option<DynDistributedTier>,
    fanout: Option<DynFanout>,
    metrics: Arc<MetricsAggregator>,
    inflight: DashMap<String, LoadCell>,
    degraded: Mutex<DegradedState>,
    recovering: AtomicBool,
    /// Bumped by every invalidation, local or from a peer.
    invalidation_epoch: AtomicU64,
    counters: Counters,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes a finished in-flight load so the next miss loads again. Runs on
/// drop so a cancelled caller cannot leave the entry behind.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, LoadCell>,
    key: &'a str,
    cell: &'a LoadCell,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.cell.initialized() {
            self.inflight
                .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.cell));
        }
    }
}

impl CacheTierManager {
    pub fn new(instance_id: InstanceId, config: CacheConfig, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            instance_id,
            local: LocalTier::new(config.local_max_entries),
            config,
            distributed: None,
            fanout: None,
            metrics,
            inflight: DashMap::new(),
            degraded: Mutex::new(DegradedState::default()),
            recovering: AtomicBool::new(false),
            invalidation_epoch: AtomicU64::new(0),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_distributed(mut self, tier: DynDistributedTier) -> Self {
        self.distributed = Some(tier);
        self
    }

    /// Channel used to tell peer instances about invalidations.
    pub fn with_fanout(mut self, fanout: DynFanout) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start the TTL sweeper and, when a fan-out channel is configured, the
    /// peer invalidation listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = manager.local.sweep(manager.config.stale_grace);
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired cache entries");
                        }
                        manager.metrics.set_gauge(CACHE_LOCAL_ENTRIES, manager.local.len() as f64, &[]);
                    }
                }
            }
        }));

        if let Some(fanout) = &self.fanout {
            let receiver = fanout.subscribe(&self.config.invalidation_topic);
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                manager.listen_for_invalidations(receiver).await;
            }));
        }
        tracing::info!(
            instance_id = %self.instance_id,
            distributed = self.distributed.as_ref().map(|t| t.name()).unwrap_or("none"),
            "cache tier manager started"
        );
    }

    /// Stop background tasks. Cached values stay readable.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("cache tier manager stopped");
    }

    /// Look a key up in the local tier, then the distributed tier.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.metrics.increment(CACHE_LOOKUPS_TOTAL, &[]);

        if let Some(value) = self.local.get_fresh(key) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(CACHE_HITS_TOTAL, &[("tier", "local")]);
            return Some(value);
        }

        if let Some(value) = self.read_distributed(key).await {
            self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(CACHE_HITS_TOTAL, &[("tier", "distributed")]);
            tracing::debug!(key = %key, "cache hit (distributed)");
            return Some(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(CACHE_MISSES_TOTAL, &[]);
        None
    }

    /// Write a value into every reachable tier.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.write_tiers(key, Arc::new(value), ttl, TierOrigin::Local)
            .await;
    }

    /// Read-through lookup. On a full miss `loader` reads the authoritative
    /// store; concurrent callers for the same key share a single load.
    ///
    /// `Ok(None)` means the store has no value; nothing is cached for it.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> LoadResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, StoreError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let cell = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.counters.collapsed_loads.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment(CACHE_COLLAPSED_LOADS_TOTAL, &[]);
                Arc::clone(occupied.get())
            }
            Entry::Vacant(vacant) => Arc::clone(&vacant.insert(Arc::new(OnceCell::new()))),
        };
        let _guard = InflightGuard {
            inflight: &self.inflight,
            key,
            cell: &cell,
        };

        cell.get_or_init(|| self.load_and_fill(key, ttl, &loader, &cell))
            .await
            .clone()
    }

    /// Remove `key` from every tier. Once this returns nothing cached under
    /// `key` is reachable through this manager; peers are notified over the
    /// fan-out channel.
    pub async fn invalidate(&self, key: &str) {
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        self.inflight.remove(key);
        self.local.remove(key);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(CACHE_INVALIDATIONS_TOTAL, &[("origin", "local")]);

        self.delete_distributed(key).await;
        self.broadcast(InvalidationNotice::new(self.instance_id.clone(), key))
            .await;
    }

    /// Remove every key starting with `prefix` from every tier and tell peers
    /// to do the same. Loads in flight under the prefix are detached so they
    /// cannot refill it with what they read before the call.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        self.inflight.retain(|key, _| !key.starts_with(prefix));
        let removed = self.local.remove_prefix(prefix);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(CACHE_INVALIDATIONS_TOTAL, &[("origin", "local")]);
        tracing::debug!(prefix = %prefix, removed, "invalidated cache prefix");

        if self.distributed.is_some() {
            match self.healthy_distributed().await {
                Some(tier) => {
                    if let Err(e) = self.call(tier.delete_prefix(prefix)).await {
                        self.mark_degraded("delete_prefix", prefix, &e);
                        self.remember_pending(PendingDelete::Prefix(prefix.to_string()));
                    }
                }
                None => self.remember_pending(PendingDelete::Prefix(prefix.to_string())),
            }
        }
        self.broadcast(InvalidationNotice::for_prefix(self.instance_id.clone(), prefix))
            .await;
    }

    /// Atomically add `delta` to a counter shared by every instance; the local
    /// tier holds it while the distributed tier is degraded.
    pub async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        if let Some(tier) = self.healthy_distributed().await {
            match self.call(tier.increment(key, delta, ttl)).await {
                Ok(value) => return Ok(value),
                Err(e @ CacheError::Serialization(_)) => return Err(e),
                Err(e) => self.mark_degraded("increment", key, &e),
            }
        }
        self.local.increment(key, delta, ttl)
    }

    /// Raise a shared counter to at least `value` in one atomic step, for
    /// deadlines that concurrent writers may all try to extend.
    pub async fn raise_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, CacheError> {
        if let Some(tier) = self.healthy_distributed().await {
            match self.call(tier.raise(key, value, ttl)).await {
                Ok(current) => return Ok(current),
                Err(e @ CacheError::Serialization(_)) => return Err(e),
                Err(e) => self.mark_degraded("raise", key, &e),
            }
        }
        self.local.raise(key, value, ttl)
    }

    /// Current value of a counter written with [`increment`](Self::increment),
    /// zero when absent.
    pub async fn get_counter(&self, key: &str) -> i64 {
        if let Some(tier) = self.healthy_distributed().await {
            match self.call(tier.get(key)).await {
                Ok(Some(found)) => return parse_counter(&found.value).unwrap_or(0),
                Ok(None) => return 0,
                Err(e) => self.mark_degraded("get_counter", key, &e),
            }
        }
        self.local
            .get_fresh(key)
            .and_then(|value| parse_counter(&value).ok())
            .unwrap_or(0)
    }

    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_typed<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.set(key, bytes, ttl).await;
        Ok(())
    }

    /// [`get_or_load`](Self::get_or_load) for MessagePack-encoded values.
    pub async fn get_or_load_typed<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        let bytes = self
            .get_or_load(key, ttl, || {
                let load = loader();
                async move {
                    match load.await {
                        Ok(Some(value)) => rmp_serde::to_vec_named(&value)
                            .map(Some)
                            .map_err(|e| StoreError::serialization(e.to_string())),
                        Ok(None) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;
        match bytes {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Local tier entry for `key`, including expired entries not yet swept.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.local.entry(key)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.lock().until.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let (degraded, pending_invalidations) = {
            let state = self.degraded.lock();
            (state.until.is_some(), state.pending.len())
        };
        let c = &self.counters;
        CacheStats {
            local_entries: self.local.len(),
            local_hits: c.local_hits.load(Ordering::Relaxed),
            distributed_hits: c.distributed_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            collapsed_loads: c.collapsed_loads.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            degraded,
            pending_invalidations,
        }
    }

    pub fn health(&self) -> CacheHealth {
        let state = self.degraded.lock();
        CacheHealth {
            backend: self.distributed.as_ref().map(|t| t.name()).unwrap_or("local"),
            degraded: state.until.is_some(),
            local_entries: self.local.len(),
            pending_invalidations: state.pending.len(),
        }
    }

    async fn load_and_fill<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: &F,
        cell: &LoadCell,
    ) -> LoadResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, StoreError>>,
    {
        // A fill may have landed between our miss and taking the load slot.
        if let Some(value) = self.local.get_fresh(key) {
            return Ok(Some(value));
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(CACHE_LOADS_TOTAL, &[]);
        let started = Instant::now();
        let timeout = self.config.loader_timeout;

        let loaded = retry_with_backoff(
            &self.config.loader_backoff,
            "cache_load",
            |_| {
                let load = loader();
                async move {
                    match tokio::time::timeout(timeout, load).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::timeout(timeout.as_millis() as u64)),
                    }
                }
            },
            StoreError::is_transient,
        )
        .await;
        self.metrics
            .observe_duration(CACHE_LOAD_DURATION_MS, started.elapsed(), &[]);

        match loaded {
            Ok(Some(bytes)) => {
                let value = Arc::new(bytes);
                self.fill(key, Arc::clone(&value), ttl, cell).await;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment(CACHE_LOAD_FAILURES_TOTAL, &[]);
                if let Some(stale) = self.local.get_stale(key, self.config.stale_grace) {
                    self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                    self.metrics.increment(CACHE_STALE_SERVED_TOTAL, &[]);
                    tracing::warn!(key = %key, error = %e, "load failed, serving stale value within grace period");
                    return Ok(Some(stale));
                }
                tracing::warn!(key = %key, error = %e, "cache load failed");
                Err(CacheError::load_failed(key, e))
            }
        }
    }

    /// Write a loaded value into the tiers unless the key was invalidated
    /// while loading. The second check undoes a write that raced an
    /// invalidation.
    async fn fill(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration, cell: &LoadCell) {
        let registered = || {
            self.inflight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current.value(), cell))
        };
        if !registered() {
            tracing::debug!(key = %key, "key invalidated during load, result not cached");
            return;
        }
        self.write_tiers(key, value, ttl, TierOrigin::Authoritative)
            .await;
        if !registered() {
            self.local.remove(key);
            self.delete_distributed(key).await;
        }
    }

    async fn write_tiers(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration, origin: TierOrigin) {
        let mut local_ttl = ttl;
        if self.distributed.is_some() {
            let written = match self.healthy_distributed().await {
                Some(tier) => match self.call(tier.set(key, &value, ttl)).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.mark_degraded("set", key, &e);
                        false
                    }
                },
                None => false,
            };
            if !written {
                // The distributed tier may still hold an older value.
                self.remember_pending(PendingDelete::Key(key.to_string()));
                local_ttl = ttl.min(self.config.degraded_ttl);
            }
        }
        self.local.insert(key, value, local_ttl, origin);
    }

    async fn read_distributed(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let tier = self.healthy_distributed().await?;
        let epoch = self.invalidation_epoch.load(Ordering::SeqCst);
        let found = match self.call(tier.get(key)).await {
            Ok(found) => found?,
            Err(e) => {
                self.mark_degraded("get", key, &e);
                return None;
            }
        };

        let ttl = found.ttl_remaining.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            return None;
        }
        let value = Arc::new(found.value);
        self.local
            .insert(key, Arc::clone(&value), ttl, TierOrigin::Distributed);
        if self.invalidation_epoch.load(Ordering::SeqCst) != epoch {
            // An invalidation ran while we were reading; drop the promotion.
            self.local.remove(key);
        }
        Some(value)
    }

    async fn delete_distributed(&self, key: &str) {
        if self.distributed.is_none() {
            return;
        }
        match self.healthy_distributed().await {
            Some(tier) => {
                if let Err(e) = self.call(tier.delete(key)).await {
                    self.mark_degraded("delete", key, &e);
                    self.remember_pending(PendingDelete::Key(key.to_string()));
                }
            }
            None => self.remember_pending(PendingDelete::Key(key.to_string())),
        }
    }

    async fn broadcast(&self, notice: InvalidationNotice) {
        let Some(fanout) = &self.fanout else {
            return;
        };
        let key = notice.key.as_str();
        let payload = match notice.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "failed to encode invalidation notice");
                return;
            }
        };
        let publish = fanout.publish(&self.config.invalidation_topic, payload);
        match tokio::time::timeout(self.config.distributed_timeout, publish).await {
            Ok(Ok(())) => tracing::debug!(key = %key, "published cache invalidation"),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "failed to publish invalidation; peers rely on TTL")
            }
            Err(_) => tracing::warn!(key = %key, "invalidation publish timed out; peers rely on TTL"),
        }
    }

    async fn listen_for_invalidations(&self, mut receiver: broadcast::Receiver<wiseup_core::FanoutMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = receiver.recv() => message,
            };
            match message {
                Ok(message) => match InvalidationNotice::decode(&message.payload) {
                    Ok(notice) if notice.origin == self.instance_id => {}
                    Ok(notice) => self.apply_peer_invalidation(&notice),
                    Err(e) => tracing::warn!(error = %e, "failed to parse invalidation notice"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "missed invalidation notices, clearing local tier");
                    self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
                    self.local.clear();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("invalidation listener stopped");
    }

    fn apply_peer_invalidation(&self, notice: &InvalidationNotice) {
        let key = notice.key.as_str();
        tracing::debug!(key = %key, prefix = notice.prefix, "received cache invalidation");
        self.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        if notice.prefix {
            self.inflight.retain(|k, _| !k.starts_with(key));
            self.local.remove_prefix(key);
        } else {
            self.inflight.remove(key);
            self.local.remove(key);
        }
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(CACHE_INVALIDATIONS_TOTAL, &[("origin", "peer")]);
    }

    async fn call<T>(&self, operation: impl Future<Output = Result<T, CacheError>>) -> Result<T, CacheError> {
        let limit = self.config.distributed_timeout;
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                millis: limit.as_millis() as u64,
            }),
        }
    }

    /// The distributed tier when it is usable right now. While degraded it is
    /// skipped until the retry deadline; then one caller pings it and
    /// replays pending invalidations.
    async fn healthy_distributed(&self) -> Option<&DynDistributedTier> {
        let tier = self.distributed.as_ref()?;
        {
            let state = self.degraded.lock();
            match state.until {
                None => return Some(tier),
                Some(until) if Instant::now() < until => return None,
                Some(_) => {}
            }
        }
        if self.recovering.swap(true, Ordering::AcqRel) {
            return None;
        }
        let recovered = self.try_recover(tier).await;
        self.recovering.store(false, Ordering::Release);
        recovered.then_some(tier)
    }

    async fn try_recover(&self, tier: &DynDistributedTier) -> bool {
        if let Err(e) = self.call(tier.ping()).await {
            self.mark_degraded("ping", "", &e);
            return false;
        }
        loop {
            let pending: Vec<PendingDelete> = {
                let mut state = self.degraded.lock();
                if state.pending.is_empty() {
                    state.until = None;
                    break;
                }
                state.pending.iter().cloned().collect()
            };
            for delete in &pending {
                let result = match delete {
                    PendingDelete::Key(key) => self.call(tier.delete(key)).await,
                    PendingDelete::Prefix(prefix) => {
                        self.call(tier.delete_prefix(prefix)).await.map(|_| ())
                    }
                };
                if let Err(e) = result {
                    self.mark_degraded("replay", delete.as_str(), &e);
                    return false;
                }
                self.degraded.lock().pending.remove(delete);
            }
            tracing::debug!(replayed = pending.len(), "replayed pending invalidations");
        }
        self.metrics.set_gauge(CACHE_DEGRADED, 0.0, &[]);
        tracing::info!(backend = tier.name(), "distributed cache recovered");
        true
    }

    fn mark_degraded(&self, operation: &str, key: &str, error: &CacheError) {
        let was_degraded = {
            let mut state = self.degraded.lock();
            let was = state.until.is_some();
            state.until = Some(Instant::now() + self.config.degraded_retry);
            was
        };
        self.metrics
            .increment(CACHE_DISTRIBUTED_FAULTS_TOTAL, &[("operation", operation)]);
        self.metrics.set_gauge(CACHE_DEGRADED, 1.0, &[]);
        if was_degraded {
            tracing::debug!(operation, key = %key, error = %error, "distributed cache still unavailable");
        } else {
            tracing::warn!(
                operation,
                key = %key,
                error = %error,
                retry_ms = self.config.degraded_retry.as_millis() as u64,
                "distributed cache unavailable, degrading to local-only"
            );
        }
    }

    fn remember_pending(&self, delete: PendingDelete) {
        self.degraded.lock().pending.insert(delete);
    }
}

impl std::fmt::Debug for CacheTierManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTierManager")
            .field("instance_id", &self.instance_id)
            .field("local_entries", &self.local.len())
            .field("distributed", &self.distributed.as_ref().map(|t| t.name()))
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
