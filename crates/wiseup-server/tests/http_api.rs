mod common;

use axum::body::Body;
use axum::http::{Request, header};
use common::{TestApp, read_json, test_config};
use serde_json::json;
use wiseup_server::Backends;

#[tokio::test]
async fn test_login_refresh_and_reuse_over_http() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;

    let first = app.login("alice", "correct horse").await;
    assert_eq!(first["token_type"], "Bearer");
    let token_a = first["refresh_token"].as_str().unwrap().to_string();

    let (status, second) = app
        .post_json("/auth/refresh", json!({ "refresh_token": token_a }), None)
        .await;
    assert_eq!(status, 200, "{second}");
    let jti_b = second["refresh_jti"].as_str().unwrap().to_string();
    assert_eq!(second["family_id"], first["family_id"]);

    let (status, body) = app
        .get_json(&format!("/auth/session/{jti_b}"), None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["active"], true);

    // Presenting the rotated-away token again revokes the family.
    let (status, body) = app
        .post_json("/auth/refresh", json!({ "refresh_token": token_a }), None)
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "token_reuse_detected");
    assert_eq!(body["reauthenticate"], true);

    let (_, body) = app
        .get_json(&format!("/auth/session/{jti_b}"), None)
        .await;
    assert_eq!(body["active"], false);

    app.stop().await;
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;

    let (status, body) = app
        .post_json(
            "/auth/login",
            json!({ "username": "alice", "password": "nope" }),
            None,
        )
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "invalid_credential");

    app.stop().await;
}

#[tokio::test]
async fn test_rate_limited_login_sets_retry_after() {
    let mut cfg = test_config();
    cfg.rate_limit.per_minute = 2;
    let app = TestApp::start(&cfg, Backends::in_memory()).await;

    for _ in 0..2 {
        let (status, _) = app
            .post_json(
                "/auth/login",
                json!({ "username": "bob", "password": "wrong" }),
                None,
            )
            .await;
        assert_eq!(status, 401);
    }

    let request = Request::post("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.10")
        .body(Body::from(
            json!({ "username": "bob", "password": "battery staple" }).to_string(),
        ))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status().as_u16(), 429);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let (_, body) = read_json(response).await;
    assert_eq!(body["reauthenticate"], false);

    app.stop().await;
}

#[tokio::test]
async fn test_sessions_require_matching_access_token() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;

    let alice = app.login("alice", "correct horse").await;
    app.login("alice", "correct horse").await;
    let bob = app.login("bob", "battery staple").await;
    let alice_access = alice["access_token"].as_str().unwrap();
    let bob_access = bob["access_token"].as_str().unwrap();

    let (status, sessions) = app
        .get_json("/auth/sessions/user-alice", Some(alice_access))
        .await;
    assert_eq!(status, 200);
    assert_eq!(sessions.as_array().unwrap().len(), 2);

    let (status, _) = app
        .get_json("/auth/sessions/user-alice", Some(bob_access))
        .await;
    assert_eq!(status, 403);

    let (status, _) = app.get_json("/auth/sessions/user-alice", None).await;
    assert_eq!(status, 401);

    // Bob cannot revoke Alice's token.
    let (status, _) = app
        .post_json(
            "/auth/revoke",
            json!({ "jti": alice["refresh_jti"] }),
            Some(bob_access),
        )
        .await;
    assert_eq!(status, 403);

    let (status, body) = app
        .post_json("/auth/revoke", json!({ "all": true }), Some(alice_access))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["revoked"], 2);

    let (_, sessions) = app
        .get_json("/auth/sessions/user-alice", Some(alice_access))
        .await;
    assert!(sessions.as_array().unwrap().is_empty());

    // A revoked session cannot be refreshed.
    let (status, body) = app
        .post_json(
            "/auth/refresh",
            json!({ "refresh_token": alice["refresh_token"] }),
            None,
        )
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["reauthenticate"], true);

    app.stop().await;
}

#[tokio::test]
async fn test_revoke_requires_one_target() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;
    let alice = app.login("alice", "correct horse").await;
    let access = alice["access_token"].as_str().unwrap();

    let (status, _) = app
        .post_json(
            "/auth/revoke",
            json!({ "jti": alice["refresh_jti"], "all": true }),
            Some(access),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = app
        .post_json(
            "/auth/revoke",
            json!({ "family_id": alice["family_id"], "reason": "user_logout" }),
            Some(access),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["revoked"], 1);

    app.stop().await;
}

#[tokio::test]
async fn test_correlation_id_is_echoed_or_generated() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;

    let response = app
        .send(
            Request::get("/health")
                .header("x-correlation-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.headers().get("x-correlation-id").unwrap(), "req-123");

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    let generated = response.headers().get("x-correlation-id").unwrap();
    assert!(!generated.is_empty());

    app.stop().await;
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let app = TestApp::start(&test_config(), Backends::in_memory()).await;
    app.login("alice", "correct horse").await;

    let (status, health) = app.get_json("/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cache"]["backend"], "local");
    assert_eq!(health["tokens"]["issued"], 1);

    let response = app
        .send(Request::get("/metrics").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("token_issued_total"), "{text}");

    let (status, snapshot) = app.get_json("/metrics/snapshot", None).await;
    assert_eq!(status, 200);
    assert!(snapshot.is_object());

    app.stop().await;
}

#[tokio::test]
async fn test_store_outage_maps_to_service_unavailable() {
    let store = std::sync::Arc::new(wiseup_storage::MemoryStore::new());
    let backends = Backends {
        store: store.clone(),
        ..Backends::in_memory()
    };
    let app = TestApp::start(&test_config(), backends).await;

    store.set_available(false);
    let (status, body) = app
        .post_json(
            "/auth/login",
            json!({ "username": "alice", "password": "correct horse" }),
            None,
        )
        .await;
    assert_eq!(status, 503, "{body}");
    assert_eq!(body["reauthenticate"], false);

    let (status, health) = app.get_json("/health", None).await;
    assert_eq!(status, 503);
    assert_eq!(health["status"], "down");

    store.set_available(true);
    app.stop().await;
}
