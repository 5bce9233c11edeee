#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, header},
};
use serde_json::Value;
use tower::ServiceExt;
use wiseup_server::config::{AppConfig, LocalUserConfig};
use wiseup_server::{Backends, CoreServices, build_app};

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.tokens.jwt_secret = SECRET.to_string();
    cfg.batch.flush_interval_ms = 50;
    cfg.identity.users = vec![
        LocalUserConfig {
            username: "alice".into(),
            user_id: "user-alice".into(),
            password: "correct horse".into(),
        },
        LocalUserConfig {
            username: "bob".into(),
            user_id: "user-bob".into(),
            password: "battery staple".into(),
        },
    ];
    cfg
}

pub struct TestApp {
    pub services: Arc<CoreServices>,
    pub router: Router,
}

impl TestApp {
    pub async fn start(cfg: &AppConfig, backends: Backends) -> Self {
        let services = Arc::new(CoreServices::with_backends(cfg, backends).await.unwrap());
        let router = build_app(cfg, Arc::clone(&services));
        Self { services, router }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn post_json(&self, uri: &str, body: Value, bearer: Option<&str>) -> (u16, Value) {
        let mut builder = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.10");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = self
            .send(builder.body(Body::from(body.to_string())).unwrap())
            .await;
        read_json(response).await
    }

    pub async fn get_json(&self, uri: &str, bearer: Option<&str>) -> (u16, Value) {
        let mut builder = Request::get(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = self.send(builder.body(Body::empty()).unwrap()).await;
        read_json(response).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Value {
        let (status, body) = self
            .post_json(
                "/auth/login",
                serde_json::json!({ "username": username, "password": password }),
                None,
            )
            .await;
        assert_eq!(status, 200, "login failed: {body}");
        body
    }

    pub async fn stop(&self) {
        self.services.shutdown().await;
    }
}

pub async fn read_json(response: Response<Body>) -> (u16, Value) {
    let status = response.status().as_u16();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}
