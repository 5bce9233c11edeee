//! Service construction and shutdown.
//!
//! Every long-lived component is built exactly once here and handed to its
//! consumers by `Arc`. Initialization order:
//!
//! 1. metrics aggregator and observability hub
//! 2. cache tier manager (distributed tier and fan-out when Redis is enabled)
//! 3. batch writer (journal recovery before the flush loop starts)
//! 4. token lifecycle service and auth monitor
//! 5. dashboard broadcaster
//!
//! Shutdown runs in reverse where it matters: dashboards are closed first, the
//! batch writer drains, and cache listeners stop last.

use anyhow::Context;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use wiseup_auth::{AuthMonitor, LocalIdentityAuthority, TokenConfig, TokenLifecycleService};
use wiseup_batch::{BatchWriter, DynJournal, FileJournal, MemoryJournal};
use wiseup_cache::{
    CacheTierManager, DynDistributedTier, RedisDistributedTier, RedisFanout, create_redis_pool,
};
use wiseup_core::{AuthEventBus, DynFanout, InstanceId, MemoryFanout};
use wiseup_storage::{DynStore, MemoryStore};
use wiseup_telemetry::hub::{AlertThresholds, TracingAlertSink, WebhookAlertSink, default_rules};
use wiseup_telemetry::{DashboardBroadcaster, MetricsAggregator, ObservabilityHub};

use crate::config::AppConfig;

/// Shared backends a process connects to. Tests build two instances over the
/// same backends to simulate a fleet.
#[derive(Clone)]
pub struct Backends {
    pub store: DynStore,
    pub distributed: Option<DynDistributedTier>,
    pub fanout: DynFanout,
}

impl Backends {
    /// In-process backends for a single node.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            distributed: None,
            fanout: Arc::new(MemoryFanout::new()),
        }
    }
}

pub struct CoreServices {
    pub instance_id: InstanceId,
    pub metrics: Arc<MetricsAggregator>,
    pub hub: Arc<ObservabilityHub>,
    pub store: DynStore,
    pub cache: Arc<CacheTierManager>,
    pub batch: Arc<BatchWriter>,
    pub events: Arc<AuthEventBus>,
    pub tokens: Arc<TokenLifecycleService>,
    pub monitor: Arc<AuthMonitor>,
    pub dashboard: Arc<DashboardBroadcaster>,
    redis_fanout: Option<Arc<RedisFanout>>,
}

impl CoreServices {
    /// Connect to the configured backends and start every component.
    pub async fn build(cfg: &AppConfig) -> anyhow::Result<Self> {
        let (backends, redis_fanout) = connect_backends(cfg).await;
        let mut services = Self::with_backends(cfg, backends).await?;
        services.redis_fanout = redis_fanout;
        Ok(services)
    }

    /// Start every component on top of already connected backends.
    pub async fn with_backends(cfg: &AppConfig, backends: Backends) -> anyhow::Result<Self> {
        let instance_id = cfg
            .instance
            .id
            .clone()
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);

        // 1. Telemetry
        let metrics = MetricsAggregator::new_shared((&cfg.metrics).into());
        let mut hub = ObservabilityHub::new(instance_id.clone(), Arc::clone(&metrics))
            .with_rules(default_rules(&AlertThresholds::from(&cfg.alerts)))
            .with_sink(Arc::new(TracingAlertSink));
        if let Some(url) = cfg.alerts.webhook_url.as_deref() {
            let sink = WebhookAlertSink::new(url, Duration::from_millis(cfg.alerts.webhook_timeout_ms))
                .context("failed to build alert webhook sink")?;
            hub = hub.with_sink(Arc::new(sink));
        }
        let hub = Arc::new(hub);

        // 2. Cache tiers
        let mut cache = CacheTierManager::new(
            instance_id.clone(),
            (&cfg.cache).into(),
            Arc::clone(&metrics),
        )
        .with_fanout(Arc::clone(&backends.fanout));
        if let Some(tier) = backends.distributed.clone() {
            cache = cache.with_distributed(tier);
        }
        let cache = Arc::new(cache);
        cache.start();

        // 3. Batch writer
        let journal: DynJournal = match cfg.batch.journal_path.as_deref() {
            Some(path) => Arc::new(
                FileJournal::open(path)
                    .await
                    .with_context(|| format!("failed to open batch journal at {path}"))?,
            ),
            None => Arc::new(MemoryJournal::new()),
        };
        let batch = BatchWriter::new(
            (&cfg.batch).into(),
            Arc::clone(&backends.store),
            journal,
            Arc::clone(&metrics),
        )
        .with_cache(Arc::clone(&cache))
        .with_hub(Arc::clone(&hub));
        let recovered = batch
            .recover()
            .await
            .context("failed to replay batch journal")?;
        if recovered > 0 {
            tracing::info!(recovered, "replayed un-flushed mutations from journal");
        }
        let batch = Arc::new(batch);
        batch.start();

        // 4. Session lifecycle and monitoring
        let events = AuthEventBus::new_shared();
        let identity = LocalIdentityAuthority::new();
        for user in &cfg.identity.users {
            identity
                .add_user(&user.username, &user.user_id, &user.password)
                .with_context(|| format!("failed to register user '{}'", user.username))?;
        }
        let mut token_config: TokenConfig = (&cfg.tokens).into();
        if token_config.jwt_secret.is_empty() {
            tracing::warn!(
                "tokens.jwt_secret is not set; using an ephemeral secret, access tokens will not verify on other instances"
            );
            token_config.jwt_secret = ephemeral_secret();
        }
        let tokens = Arc::new(
            TokenLifecycleService::new(
                token_config,
                (&cfg.rate_limit).into(),
                Arc::clone(&backends.store),
                Arc::clone(&cache),
                Arc::clone(&events),
                Arc::clone(&hub),
            )
            .with_identity(Arc::new(identity))
            .with_audit(Arc::clone(&batch)),
        );
        let monitor = Arc::new(AuthMonitor::new(
            (&cfg.monitor).into(),
            Arc::clone(&cache),
            Arc::clone(&hub),
        ));
        monitor.start(&events);

        // 5. Dashboards
        let dashboard = Arc::new(
            DashboardBroadcaster::new(
                instance_id.clone(),
                Arc::clone(&metrics),
                Arc::clone(&backends.fanout),
                (&cfg.dashboard).into(),
            )
            .with_hub(Arc::clone(&hub)),
        );
        dashboard.start();

        tracing::info!(
            instance = %instance_id,
            store = backends.store.backend_name(),
            distributed = backends.distributed.is_some(),
            fanout = backends.fanout.name(),
            "session core started"
        );

        Ok(Self {
            instance_id,
            metrics,
            hub,
            store: backends.store,
            cache,
            batch,
            events,
            tokens,
            monitor,
            dashboard,
            redis_fanout: None,
        })
    }

    /// Close dashboards, drain the batch writer, then release cache resources.
    pub async fn shutdown(&self) {
        self.dashboard.shutdown().await;
        self.monitor.shutdown().await;
        let report = self.batch.shutdown().await;
        tracing::info!(
            applied = report.applied,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "batch writer drained"
        );
        self.cache.shutdown().await;
        if let Some(fanout) = &self.redis_fanout {
            fanout.shutdown();
        }
        tracing::info!(instance = %self.instance_id, "session core stopped");
    }
}

/// Redis backs the distributed tier and the fan-out channel when enabled and
/// reachable; otherwise the process runs local-only.
async fn connect_backends(cfg: &AppConfig) -> (Backends, Option<Arc<RedisFanout>>) {
    let mut backends = Backends::in_memory();
    if !cfg.redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return (backends, None);
    }

    tracing::info!(url = %cfg.redis.url, "Connecting to Redis");
    let pool = match create_redis_pool(
        &cfg.redis.url,
        cfg.redis.pool_size,
        Duration::from_millis(cfg.redis.timeout_ms),
    ) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool. Falling back to local cache.");
            return (backends, None);
        }
    };

    if let Err(e) = pool.get().await {
        tracing::warn!(error = %e, "Failed to connect to Redis. Falling back to local cache.");
        return (backends, None);
    }
    tracing::info!("Connected to Redis");

    let fanout = Arc::new(RedisFanout::new(pool.clone(), cfg.redis.url.clone()));
    backends.distributed = Some(Arc::new(RedisDistributedTier::new(
        pool,
        cfg.redis.key_prefix.clone(),
    )));
    backends.fanout = Arc::clone(&fanout) as DynFanout;
    (backends, Some(fanout))
}

fn ephemeral_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
