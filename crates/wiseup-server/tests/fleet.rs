//! Two server instances sharing one store, distributed tier and fanout bus.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestApp, test_config};
use serde_json::json;
use tokio::sync::mpsc;
use wiseup_batch::Mutation;
use wiseup_cache::MemoryDistributedTier;
use wiseup_core::MemoryFanout;
use wiseup_server::Backends;
use wiseup_server::config::AppConfig;
use wiseup_storage::{AuthoritativeStore, MemoryStore};
use wiseup_telemetry::DashboardMessage;

struct Fleet {
    store: Arc<MemoryStore>,
    a: TestApp,
    b: TestApp,
}

fn node_config(id: &str) -> AppConfig {
    let mut cfg = test_config();
    cfg.instance.id = Some(id.to_string());
    cfg.dashboard.publish_interval_ms = 50;
    cfg
}

async fn start_fleet() -> Fleet {
    let store = Arc::new(MemoryStore::new());
    let distributed = Arc::new(MemoryDistributedTier::new());
    let fanout = Arc::new(MemoryFanout::new());

    let backends = || Backends {
        store: store.clone(),
        distributed: Some(distributed.clone()),
        fanout: fanout.clone(),
    };

    let a = TestApp::start(&node_config("node-a"), backends()).await;
    let b = TestApp::start(&node_config("node-b"), backends()).await;
    Fleet { store, a, b }
}

impl Fleet {
    async fn stop(self) {
        self.a.stop().await;
        self.b.stop().await;
    }
}

#[tokio::test]
async fn test_reuse_is_detected_across_instances() {
    let fleet = start_fleet().await;

    let first = fleet.a.login("alice", "correct horse").await;
    let token_a = first["refresh_token"].as_str().unwrap().to_string();

    // Rotated on node B.
    let (status, second) = fleet
        .b
        .post_json("/auth/refresh", json!({ "refresh_token": token_a }), None)
        .await;
    assert_eq!(status, 200, "{second}");
    let jti_b = second["refresh_jti"].as_str().unwrap().to_string();

    // Replayed on node A.
    let (status, body) = fleet
        .a
        .post_json("/auth/refresh", json!({ "refresh_token": token_a }), None)
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "token_reuse_detected");

    let (_, body) = fleet
        .b
        .get_json(&format!("/auth/session/{jti_b}"), None)
        .await;
    assert_eq!(body["active"], false);

    let (status, body) = fleet
        .b
        .post_json(
            "/auth/refresh",
            json!({ "refresh_token": second["refresh_token"] }),
            None,
        )
        .await;
    assert_eq!(status, 401, "{body}");

    fleet.stop().await;
}

#[tokio::test]
async fn test_revocation_on_one_node_is_seen_by_the_other() {
    let fleet = start_fleet().await;

    let pair = fleet.a.login("bob", "battery staple").await;
    let jti = pair["refresh_jti"].as_str().unwrap().to_string();

    let (_, body) = fleet.b.get_json(&format!("/auth/session/{jti}"), None).await;
    assert_eq!(body["active"], true);

    let (status, _) = fleet
        .a
        .post_json(
            "/auth/revoke",
            json!({ "jti": jti }),
            pair["access_token"].as_str(),
        )
        .await;
    assert_eq!(status, 200);

    let (_, body) = fleet.b.get_json(&format!("/auth/session/{jti}"), None).await;
    assert_eq!(body["active"], false);

    fleet.stop().await;
}

#[tokio::test]
async fn test_dashboard_merges_peer_snapshots() {
    let fleet = start_fleet().await;
    fleet.b.login("alice", "correct horse").await;

    let (tx, mut rx) = mpsc::channel(64);
    let handle = fleet.a.services.dashboard.subscribe(tx);

    let merged = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(message) = rx.recv().await {
            match message.as_ref() {
                DashboardMessage::Snapshot { view } if view.origin("node-b").is_some() => {
                    return Some(view.clone());
                }
                DashboardMessage::Ping { .. } => fleet.a.services.dashboard.ack(handle),
                _ => {}
            }
        }
        None
    })
    .await
    .expect("no merged snapshot within timeout")
    .expect("observer channel closed");

    assert!(merged.origin("node-a").is_some());
    assert!(merged.origin("node-b").is_some());

    fleet.a.services.dashboard.unsubscribe(handle);
    fleet.stop().await;
}

#[tokio::test]
async fn test_concurrent_increments_from_both_nodes_are_not_lost() {
    let fleet = start_fleet().await;

    let mut tasks = Vec::new();
    for app in [&fleet.a, &fleet.b] {
        for _ in 0..50 {
            let batch = Arc::clone(&app.services.batch);
            tasks.push(tokio::spawn(async move {
                batch
                    .enqueue(Mutation::increment("stats", "logins", 1))
                    .await
                    .unwrap();
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    fleet.a.services.batch.flush_all().await;
    fleet.b.services.batch.flush_all().await;

    let row = fleet.store.get("stats", "logins").await.unwrap().unwrap();
    assert_eq!(row.as_counter(), 100);

    fleet.stop().await;
}
