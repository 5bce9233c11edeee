//! Live dashboard broadcaster.
//!
//! One publish loop per instance: take an aggregator snapshot, publish it to
//! the shared fan-out topic, then push the merged fleet view to every local
//! observer. A listener merges peer snapshots by origin; a liveness loop pings
//! observers and evicts the ones that stop acknowledging.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiseup_core::{DynFanout, InstanceId};

use super::merge::{PeerTable, fleet_totals};
use super::message::{DashboardMessage, DashboardSnapshot, FleetView};
use crate::aggregator::MetricsAggregator;
use crate::error::TelemetryError;
use crate::hub::ObservabilityHub;
use crate::names;

pub const SNAPSHOT_TOPIC: &str = "dashboard:snapshots";

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub publish_interval: Duration,
    /// Upper bound on producing a local snapshot before the tick goes stale.
    pub snapshot_timeout: Duration,
    /// Peers not heard from for this long leave the merged view.
    pub peer_ttl: Duration,
    pub ping_interval: Duration,
    /// Observers that have not acknowledged for this long are evicted.
    pub liveness_timeout: Duration,
    /// Per-observer outbound queue; a full queue evicts the observer.
    pub observer_buffer: usize,
    pub topic: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(2),
            peer_ttl: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            observer_buffer: 16,
            topic: SNAPSHOT_TOPIC.to_string(),
        }
    }
}

/// Identifies one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

struct Observer {
    tx: mpsc::Sender<Arc<DashboardMessage>>,
    last_ack: Mutex<Instant>,
}

pub struct DashboardBroadcaster {
    instance_id: InstanceId,
    metrics: Arc<MetricsAggregator>,
    hub: Option<Arc<ObservabilityHub>>,
    fanout: DynFanout,
    config: DashboardConfig,
    sequence: AtomicU64,
    ping_nonce: AtomicU64,
    next_observer: AtomicU64,
    peers: RwLock<PeerTable>,
    observers: DashMap<u64, Observer>,
    last_view: ArcSwapOption<FleetView>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DashboardBroadcaster {
    pub fn new(
        instance_id: InstanceId,
        metrics: Arc<MetricsAggregator>,
        fanout: DynFanout,
        config: DashboardConfig,
    ) -> Self {
        Self {
            instance_id,
            metrics,
            hub: None,
            fanout,
            config,
            sequence: AtomicU64::new(0),
            ping_nonce: AtomicU64::new(0),
            next_observer: AtomicU64::new(1),
            peers: RwLock::new(PeerTable::default()),
            observers: DashMap::new(),
            last_view: ArcSwapOption::empty(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Evaluate the hub's alert rules on every fresh snapshot and include
    /// active alerts in the merged view.
    #[must_use]
    pub fn with_hub(mut self, hub: Arc<ObservabilityHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Spawn the publish, peer listener and liveness loops.
    pub fn start(self: &Arc<Self>) {
        // Subscribe before spawning so no peer snapshot published after start is missed.
        let peer_rx = self.fanout.subscribe(&self.config.topic);
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().publish_loop()));
        tasks.push(tokio::spawn(self.clone().peer_loop(peer_rx)));
        tasks.push(tokio::spawn(self.clone().liveness_loop()));
        tracing::info!(
            instance = %self.instance_id,
            interval_ms = self.config.publish_interval.as_millis() as u64,
            fanout = self.fanout.name(),
            "dashboard broadcaster started"
        );
    }

    /// Register an observer and immediately send it the current merged view.
    pub fn subscribe(&self, tx: mpsc::Sender<Arc<DashboardMessage>>) -> SubscriptionHandle {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let view = match self.last_view.load_full() {
            Some(view) => view,
            None => {
                let snapshot = self.local_snapshot(self.metrics.snapshot());
                self.peers.write().merge(snapshot, Instant::now());
                self.build_view(false)
            }
        };
        let first = Arc::new(DashboardMessage::Snapshot {
            view: view.as_ref().clone(),
        });
        let handle = SubscriptionHandle(id);
        if tx.try_send(first).is_err() {
            tracing::debug!(observer = id, "observer closed before first snapshot");
            return handle;
        }
        self.observers.insert(
            id,
            Observer {
                tx,
                last_ack: Mutex::new(Instant::now()),
            },
        );
        self.metrics
            .set_gauge(names::DASHBOARD_OBSERVERS, self.observers.len() as f64, &[]);
        tracing::debug!(observer = id, "dashboard observer subscribed");
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.observers.remove(&handle.0).is_some();
        if removed {
            self.metrics
                .set_gauge(names::DASHBOARD_OBSERVERS, self.observers.len() as f64, &[]);
            tracing::debug!(observer = handle.0, "dashboard observer unsubscribed");
        }
        removed
    }

    /// Record a liveness acknowledgement from an observer.
    pub fn ack(&self, handle: SubscriptionHandle) {
        if let Some(observer) = self.observers.get(&handle.0) {
            *observer.last_ack.lock() = Instant::now();
        }
    }

    /// Merge `snapshot` as this instance's latest and publish it to peers.
    pub async fn publish_local_snapshot(
        &self,
        snapshot: DashboardSnapshot,
    ) -> Result<(), TelemetryError> {
        let payload = serde_json::to_vec(&snapshot)?;
        self.peers.write().merge(snapshot, Instant::now());
        self.fanout.publish(&self.config.topic, payload).await?;
        self.metrics
            .increment(names::DASHBOARD_PUBLISHED_TOTAL, &[]);
        Ok(())
    }

    /// One publish cycle. On a snapshot timeout the last known view is pushed
    /// tagged stale and `SnapshotStale` is returned.
    pub async fn tick(&self) -> Result<(), TelemetryError> {
        let metrics = self.metrics.clone();
        let produced = tokio::time::timeout(
            self.config.snapshot_timeout,
            tokio::task::spawn_blocking(move || metrics.snapshot()),
        )
        .await;

        let snapshot = match produced {
            Ok(Ok(snapshot)) => snapshot,
            _ => {
                self.metrics
                    .increment(names::DASHBOARD_STALE_SNAPSHOTS_TOTAL, &[]);
                if let Some(last) = self.last_view.load_full() {
                    let mut stale = last.as_ref().clone();
                    stale.stale = true;
                    self.push(Arc::new(DashboardMessage::Snapshot { view: stale }));
                }
                return Err(TelemetryError::SnapshotStale {
                    waited_ms: self.config.snapshot_timeout.as_millis() as u64,
                });
            }
        };

        if let Some(hub) = &self.hub {
            hub.evaluate_rules(&snapshot);
        }

        let local = self.local_snapshot(snapshot);
        if let Err(e) = self.publish_local_snapshot(local).await {
            // Peers miss this cycle; local observers still get the view.
            tracing::warn!(error = %e, "failed to publish dashboard snapshot to peers");
        }

        let expired = self
            .peers
            .write()
            .expire(self.config.peer_ttl, Instant::now(), self.instance_id.as_str());
        for origin in expired {
            tracing::info!(origin = %origin, "dashboard peer expired");
        }
        self.metrics
            .set_gauge(names::DASHBOARD_PEERS, self.peer_count() as f64, &[]);

        let view = self.build_view(false);
        self.push(Arc::new(DashboardMessage::Snapshot {
            view: view.as_ref().clone(),
        }));
        Ok(())
    }

    /// Latest merged view, if one was built.
    pub fn current_view(&self) -> Option<Arc<FleetView>> {
        self.last_view.load_full()
    }

    /// Merge a snapshot received from the fan-out channel.
    pub fn merge_peer_snapshot(&self, snapshot: DashboardSnapshot) -> bool {
        self.peers.write().merge(snapshot, Instant::now())
    }

    /// Close every observer and stop the background loops.
    pub async fn shutdown(&self) {
        let close = Arc::new(DashboardMessage::Close {
            reason: "server shutting down".to_string(),
        });
        for observer in self.observers.iter() {
            let _ = observer.tx.try_send(close.clone());
        }
        let closed = self.observers.len();
        self.observers.clear();
        self.metrics.set_gauge(names::DASHBOARD_OBSERVERS, 0.0, &[]);

        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(observers = closed, "dashboard broadcaster stopped");
    }

    fn local_snapshot(&self, snapshot: crate::sample::MetricsSnapshot) -> DashboardSnapshot {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        DashboardSnapshot::from_metrics(self.instance_id.as_str(), sequence, snapshot)
    }

    fn build_view(&self, stale: bool) -> Arc<FleetView> {
        let origins = self.peers.read().origins();
        let totals = fleet_totals(&origins);
        let alerts = self
            .hub
            .as_ref()
            .map(|hub| hub.active_alerts())
            .unwrap_or_default();
        let view = Arc::new(FleetView {
            instance_id: self.instance_id.to_string(),
            generated_at: OffsetDateTime::now_utc(),
            stale,
            origins,
            totals,
            alerts,
        });
        self.last_view.store(Some(view.clone()));
        view
    }

    /// Send to every observer; a full or closed queue evicts the observer.
    fn push(&self, message: Arc<DashboardMessage>) {
        let mut evicted = Vec::new();
        for observer in self.observers.iter() {
            if let Err(e) = observer.tx.try_send(message.clone()) {
                tracing::debug!(observer = *observer.key(), error = %e, "observer not keeping up");
                evicted.push(*observer.key());
            }
        }
        self.evict(evicted, "send failed");
    }

    fn evict(&self, ids: Vec<u64>, reason: &'static str) {
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            self.observers.remove(id);
            self.metrics
                .increment(names::DASHBOARD_EVICTIONS_TOTAL, &[("reason", reason)]);
        }
        self.metrics
            .set_gauge(names::DASHBOARD_OBSERVERS, self.observers.len() as f64, &[]);
        tracing::info!(count = ids.len(), reason, "evicted dashboard observers");
    }

    fn check_liveness(&self) {
        let now = Instant::now();
        let nonce = self.ping_nonce.fetch_add(1, Ordering::Relaxed) + 1;
        let ping = Arc::new(DashboardMessage::Ping { nonce });
        let mut silent = Vec::new();
        let mut failed = Vec::new();
        for observer in self.observers.iter() {
            let last_ack = *observer.last_ack.lock();
            if now.duration_since(last_ack) > self.config.liveness_timeout {
                silent.push(*observer.key());
            } else if observer.tx.try_send(ping.clone()).is_err() {
                failed.push(*observer.key());
            }
        }
        self.evict(silent, "liveness timeout");
        self.evict(failed, "send failed");
    }

    async fn publish_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.publish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "dashboard tick degraded");
                    }
                }
            }
        }
    }

    async fn peer_loop(self: Arc<Self>, mut rx: broadcast::Receiver<wiseup_core::FanoutMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            match message {
                Ok(message) => {
                    match serde_json::from_slice::<DashboardSnapshot>(&message.payload) {
                        Ok(snapshot) if snapshot.origin_instance_id == self.instance_id.as_str() => {}
                        Ok(snapshot) => {
                            let origin = snapshot.origin_instance_id.clone();
                            if self.merge_peer_snapshot(snapshot) {
                                tracing::trace!(origin = %origin, "merged peer snapshot");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "undecodable dashboard snapshot"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dashboard peer listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.check_liveness(),
            }
        }
    }
}

impl std::fmt::Debug for DashboardBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardBroadcaster")
            .field("instance_id", &self.instance_id)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiseup_core::MemoryFanout;

    fn broadcaster(id: &str, fanout: &MemoryFanout) -> Arc<DashboardBroadcaster> {
        let metrics = Arc::new(MetricsAggregator::default());
        Arc::new(DashboardBroadcaster::new(
            InstanceId::new(id),
            metrics,
            Arc::new(fanout.clone()),
            DashboardConfig {
                publish_interval: Duration::from_millis(50),
                ..Default::default()
            },
        ))
    }

    fn expect_view(message: Arc<DashboardMessage>) -> FleetView {
        match message.as_ref() {
            DashboardMessage::Snapshot { view } => view.clone(),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_view_immediately() {
        let fanout = MemoryFanout::new();
        let b = broadcaster("i1", &fanout);
        b.metrics.increment("logins", &[]);

        let (tx, mut rx) = mpsc::channel(4);
        let _handle = b.subscribe(tx);
        let view = expect_view(rx.try_recv().unwrap());
        assert_eq!(view.origins.len(), 1);
        assert_eq!(view.total("logins"), Some(1.0));
        assert_eq!(b.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_full_observer_is_evicted() {
        let fanout = MemoryFanout::new();
        let b = broadcaster("i1", &fanout);
        let (tx, _rx) = mpsc::channel(1);
        b.subscribe(tx);
        assert_eq!(b.observer_count(), 1);

        b.tick().await.unwrap();
        assert_eq!(b.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_shutdown() {
        let fanout = MemoryFanout::new();
        let b = broadcaster("i1", &fanout);
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let h1 = b.subscribe(tx1);
        b.subscribe(tx2);

        assert!(b.unsubscribe(h1));
        assert!(!b.unsubscribe(h1));

        b.shutdown().await;
        assert_eq!(b.observer_count(), 0);
        let _first = rx2.recv().await.unwrap();
        assert!(matches!(
            rx2.recv().await.unwrap().as_ref(),
            DashboardMessage::Close { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_observer_evicted_after_liveness_timeout() {
        let fanout = MemoryFanout::new();
        let b = broadcaster("i1", &fanout);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = b.subscribe(tx);

        tokio::time::advance(b.config.liveness_timeout / 2).await;
        b.check_liveness();
        assert_eq!(b.observer_count(), 1);
        let _ = rx.recv().await;
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DashboardMessage::Ping { .. }
        ));
        b.ack(handle);

        tokio::time::advance(b.config.liveness_timeout + Duration::from_secs(1)).await;
        b.check_liveness();
        assert_eq!(b.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_two_instances_merge_by_origin() {
        let fanout = MemoryFanout::new();
        let one = broadcaster("1", &fanout);
        let two = broadcaster("2", &fanout);
        one.start();
        two.start();
        one.metrics.increment("logins", &[]);
        two.metrics.increment_by("logins", &[], 2);

        let (tx, mut rx) = mpsc::channel(64);
        one.subscribe(tx);

        let merged = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let view = match rx.recv().await.unwrap().as_ref() {
                    DashboardMessage::Snapshot { view } => view.clone(),
                    _ => continue,
                };
                if view.origin("1").is_some() && view.origin("2").is_some() {
                    break view;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(merged.total("logins"), Some(3.0));
        one.shutdown().await;
        two.shutdown().await;
    }
}
