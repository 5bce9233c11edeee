//! Two service instances sharing one store, distributed tier and fan-out bus.

use std::sync::Arc;
use std::time::Duration;
use wiseup_auth::{
    AuthError, RateLimitConfig, RequestContext, TokenConfig, TokenLifecycleService,
};
use wiseup_batch::{BatchConfig, BatchWriter, MemoryJournal};
use wiseup_cache::{CacheConfig, CacheTierManager, MemoryDistributedTier};
use wiseup_core::{AuthEventBus, DynFanout, InstanceId, MemoryFanout};
use wiseup_storage::{AuthoritativeStore, MemoryStore};
use wiseup_telemetry::{AggregatorConfig, MetricsAggregator, ObservabilityHub};

struct Instance {
    service: TokenLifecycleService,
    cache: Arc<CacheTierManager>,
    writer: Arc<BatchWriter>,
}

fn instance(store: &Arc<MemoryStore>, tier: &MemoryDistributedTier, fanout: &DynFanout) -> Instance {
    let id = InstanceId::generate();
    let metrics = MetricsAggregator::new_shared(AggregatorConfig::default());
    let cache = Arc::new(
        CacheTierManager::new(id.clone(), CacheConfig::default(), Arc::clone(&metrics))
            .with_distributed(Arc::new(tier.clone()))
            .with_fanout(Arc::clone(fanout)),
    );
    cache.start();
    let writer = Arc::new(
        BatchWriter::new(
            BatchConfig::default(),
            store.clone(),
            Arc::new(MemoryJournal::new()),
            Arc::clone(&metrics),
        )
        .with_cache(Arc::clone(&cache)),
    );
    let hub = Arc::new(ObservabilityHub::new(id, metrics));
    let service = TokenLifecycleService::new(
        TokenConfig {
            jwt_secret: "shared-secret".into(),
            ..TokenConfig::default()
        },
        RateLimitConfig::default(),
        store.clone(),
        Arc::clone(&cache),
        AuthEventBus::new_shared(),
        hub,
    )
    .with_audit(Arc::clone(&writer));
    Instance {
        service,
        cache,
        writer,
    }
}

async fn eventually_inactive(service: &TokenLifecycleService, jti: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while service.is_active(jti).await.unwrap() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{jti} still active on peer"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_reuse_on_one_instance_revokes_everywhere() {
    let store = Arc::new(MemoryStore::new());
    let tier = MemoryDistributedTier::new();
    let fanout: DynFanout = Arc::new(MemoryFanout::new());
    let one = instance(&store, &tier, &fanout);
    let two = instance(&store, &tier, &fanout);
    let ctx = RequestContext::from_source("198.51.100.7");

    let a = one.service.issue("user-42", &ctx).await.unwrap();
    let b = one.service.rotate(&a.token, &ctx).await.unwrap();

    // Both instances now hold the family in their caches.
    assert!(one.service.is_active(&b.refresh.jti).await.unwrap());
    assert!(two.service.is_active(&b.refresh.jti).await.unwrap());

    // The stolen token shows up on the other instance.
    let reuse = two.service.rotate(&a.token, &ctx).await;
    assert!(matches!(reuse, Err(AuthError::TokenReuseDetected { .. })));

    eventually_inactive(&one.service, &b.refresh.jti).await;
    assert!(!two.service.is_active(&b.refresh.jti).await.unwrap());

    one.cache.shutdown().await;
    two.cache.shutdown().await;
}

#[tokio::test]
async fn test_rotation_on_peer_is_seen_as_reuse_locally() {
    let store = Arc::new(MemoryStore::new());
    let tier = MemoryDistributedTier::new();
    let fanout: DynFanout = Arc::new(MemoryFanout::new());
    let one = instance(&store, &tier, &fanout);
    let two = instance(&store, &tier, &fanout);
    let ctx = RequestContext::default();

    let a = one.service.issue("user-7", &ctx).await.unwrap();
    let b = two.service.rotate(&a.token, &ctx).await.unwrap();
    let replay = one.service.rotate(&a.token, &ctx).await;
    assert!(matches!(replay, Err(AuthError::TokenReuseDetected { .. })));
    assert!(!two.service.is_active(&b.refresh.jti).await.unwrap());

    one.cache.shutdown().await;
    two.cache.shutdown().await;
}

#[tokio::test]
async fn test_audit_rows_reach_the_store() {
    let store = Arc::new(MemoryStore::new());
    let tier = MemoryDistributedTier::new();
    let fanout: DynFanout = Arc::new(MemoryFanout::new());
    let one = instance(&store, &tier, &fanout);
    let ctx = RequestContext::default();

    let a = one.service.issue("user-1", &ctx).await.unwrap();
    one.service.rotate(&a.token, &ctx).await.unwrap();
    one.service
        .revoke(wiseup_auth::RevokeTarget::Family(a.refresh.family_id.clone()), "logout")
        .await
        .unwrap();

    let report = one.writer.flush_all().await;
    assert_eq!(report.dead_lettered, 0);
    for action in ["issue", "rotate", "revoke"] {
        let row = store.get("auth_stats", action).await.unwrap().unwrap();
        assert_eq!(row.value, serde_json::json!(1), "{action}");
    }

    one.cache.shutdown().await;
}
