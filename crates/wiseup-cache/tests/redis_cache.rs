//! Redis-backed distributed tier and fan-out.
//!
//! These tests start a Redis container and are ignored by default:
//! `cargo test -p wiseup-cache -- --ignored`.

use std::sync::Arc;
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use wiseup_cache::{
    CacheConfig, CacheTierManager, DistributedTier, RedisDistributedTier, RedisFanout,
    create_redis_pool,
};
use wiseup_core::{FanoutChannel, InstanceId};
use wiseup_telemetry::MetricsAggregator;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, format!("redis://127.0.0.1:{port}"))
        })
        .await;
    url.clone()
}

async fn tier(prefix: &str) -> RedisDistributedTier {
    let url = redis_url().await;
    let pool = create_redis_pool(&url, 4, Duration::from_secs(2)).expect("pool");
    RedisDistributedTier::new(pool, prefix)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_get_reports_remaining_ttl() {
    let tier = tier("ttl").await;
    tier.ping().await.unwrap();
    tier.set("k", b"v", Duration::from_secs(30)).await.unwrap();

    let found = tier.get("k").await.unwrap().unwrap();
    assert_eq!(found.value, b"v");
    let ttl = found.ttl_remaining.unwrap();
    assert!(ttl <= Duration::from_secs(30) && ttl > Duration::from_secs(25));

    tier.delete("k").await.unwrap();
    assert!(tier.get("k").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_increment_sets_expiry_once() {
    let tier = tier("incr").await;
    assert_eq!(tier.increment("c", 2, Duration::from_secs(60)).await.unwrap(), 2);
    assert_eq!(tier.increment("c", 3, Duration::from_secs(60)).await.unwrap(), 5);
    let found = tier.get("c").await.unwrap().unwrap();
    assert_eq!(found.value, b"5");
    assert!(found.ttl_remaining.is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_increment_restores_missing_expiry() {
    let tier = tier("incr-ttl").await;
    let url = redis_url().await;
    let pool = create_redis_pool(&url, 1, Duration::from_secs(2)).unwrap();
    let mut conn = pool.get().await.unwrap();
    // A counter left without an expiry by an interrupted writer.
    let _: () = redis::cmd("SET")
        .arg("incr-ttl:orphan")
        .arg(7)
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(tier.increment("orphan", 1, Duration::from_secs(30)).await.unwrap(), 8);
    let found = tier.get("orphan").await.unwrap().unwrap();
    assert!(found.ttl_remaining.is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_raise_is_set_if_greater() {
    let tier = tier("raise").await;
    assert_eq!(tier.raise("lock", 500, Duration::from_secs(30)).await.unwrap(), 500);
    assert_eq!(tier.raise("lock", 400, Duration::from_secs(30)).await.unwrap(), 500);
    assert_eq!(tier.raise("lock", 600, Duration::from_secs(30)).await.unwrap(), 600);
    let found = tier.get("lock").await.unwrap().unwrap();
    assert_eq!(found.value, b"600");
    assert!(found.ttl_remaining.is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_delete_prefix_scans_only_the_prefix() {
    let tier = tier("scan").await;
    for i in 0..450 {
        tier.set(&format!("user:9:{i}"), b"v", Duration::from_secs(60))
            .await
            .unwrap();
    }
    tier.set("user:90:a", b"v", Duration::from_secs(60)).await.unwrap();
    tier.set("user:9*", b"v", Duration::from_secs(60)).await.unwrap();

    assert_eq!(tier.delete_prefix("user:9:").await.unwrap(), 450);
    assert!(tier.get("user:9:0").await.unwrap().is_none());
    assert!(tier.get("user:90:a").await.unwrap().is_some());
    assert!(tier.get("user:9*").await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_two_managers_share_redis_and_invalidate() {
    let url = redis_url().await;
    let build = |pool: deadpool_redis::Pool| {
        Arc::new(
            CacheTierManager::new(
                InstanceId::generate(),
                CacheConfig::default(),
                MetricsAggregator::new_shared(Default::default()),
            )
            .with_distributed(Arc::new(RedisDistributedTier::new(pool.clone(), "shared")))
            .with_fanout(Arc::new(RedisFanout::new(pool, url.clone()))),
        )
    };
    let a = build(create_redis_pool(&url, 4, Duration::from_secs(2)).unwrap());
    let b = build(create_redis_pool(&url, 4, Duration::from_secs(2)).unwrap());
    a.start();
    b.start();
    // let the pub/sub listeners subscribe
    tokio::time::sleep(Duration::from_millis(300)).await;

    a.set("user:1", b"alice".to_vec(), Duration::from_secs(60)).await;
    assert_eq!(b.get("user:1").await.unwrap().as_slice(), b"alice");

    a.invalidate("user:1").await;
    for _ in 0..50 {
        if b.entry("user:1").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(b.get("user:1").await.is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_fanout_delivers_to_subscribers() {
    let url = redis_url().await;
    let pool = create_redis_pool(&url, 4, Duration::from_secs(2)).unwrap();
    let fanout = RedisFanout::new(pool, url);
    let mut rx = fanout.subscribe("test:topic");
    tokio::time::sleep(Duration::from_millis(300)).await;

    fanout.publish("test:topic", b"hello".to_vec()).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload.as_slice(), b"hello");
    fanout.shutdown();
}
