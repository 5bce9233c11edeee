use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wiseup_auth::{Credential, RevokeTarget, SessionInfo, TokenPair};

use crate::error::ApiError;
use crate::middleware::{Authenticated, ClientSource};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Exactly one target: a token (its whole family), a family, or every session
/// of the caller.
#[derive(Debug, Default, Deserialize)]
pub struct RevokeRequest {
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub family_id: Option<String>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub jti: String,
    pub active: bool,
}

pub async fn login(
    State(state): State<AppState>,
    source: ClientSource,
    Json(credential): Json<Credential>,
) -> Result<Json<TokenPair>, ApiError> {
    if credential.username.is_empty() {
        return Err(ApiError::BadRequest("username is required".into()));
    }
    let pair = state
        .services
        .tokens
        .login(&credential, &source.context())
        .await?;
    Ok(Json(pair))
}

pub async fn refresh(
    State(state): State<AppState>,
    source: ClientSource,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    if body.refresh_token.is_empty() {
        return Err(ApiError::BadRequest("refresh_token is required".into()));
    }
    let pair = state
        .services
        .tokens
        .refresh(&body.refresh_token, &source.context())
        .await?;
    Ok(Json(pair))
}

pub async fn revoke(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Json(body): Json<RevokeRequest>,
) -> Result<Json<RevokeResponse>, ApiError> {
    let tokens = &state.services.tokens;
    let reason = body.reason.as_deref().unwrap_or("logout");

    let revoked = match (body.jti, body.family_id, body.all) {
        (Some(jti), None, false) => {
            let token = tokens.find_token(&jti).await?.ok_or(ApiError::NotFound)?;
            if token.user_id != claims.sub {
                return Err(ApiError::Forbidden);
            }
            usize::from(tokens.revoke(RevokeTarget::Token(jti), reason).await?)
        }
        (None, Some(family_id), false) => {
            let owned = tokens
                .list_sessions(&claims.sub)
                .await?
                .iter()
                .any(|s| s.family_id == family_id);
            if !owned {
                return Err(ApiError::NotFound);
            }
            usize::from(tokens.revoke(RevokeTarget::Family(family_id), reason).await?)
        }
        (None, None, true) => tokens.revoke_all_for_user(&claims.sub, reason).await?,
        _ => {
            return Err(ApiError::BadRequest(
                "specify exactly one of jti, family_id or all".into(),
            ));
        }
    };
    Ok(Json(RevokeResponse { revoked }))
}

/// Session validity check used by request authorization elsewhere.
pub async fn session_status(
    State(state): State<AppState>,
    Path(jti): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let active = state.services.tokens.is_active(&jti).await?;
    Ok(Json(SessionStatus { jti, active }))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Authenticated(claims): Authenticated,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    if claims.sub != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(state.services.tokens.list_sessions(&user_id).await?))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    let cache = services.cache.health();
    let monitor = services.monitor.get_health_snapshot().await;
    let batch = services.batch.stats();
    let store_ok = services.store.ping().await.is_ok();

    let status = if !store_ok {
        "down"
    } else if cache.degraded || !monitor.active_anomalies.is_empty() {
        "degraded"
    } else {
        "ok"
    };
    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body: Value = json!({
        "status": status,
        "instance_id": services.instance_id,
        "store": { "backend": services.store.backend_name(), "ok": store_ok },
        "cache": cache,
        "monitor": monitor,
        "batch": batch,
        "tokens": services.tokens.stats(),
        "dashboard": {
            "observers": services.dashboard.observer_count(),
            "peers": services.dashboard.peer_count(),
        },
        "alerts": services.hub.active_alerts(),
    });
    (code, Json(body))
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.services.metrics.render_prometheus(),
    )
}

pub async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.services.metrics.snapshot())
}
