use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderName, HeaderValue, Request, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use wiseup_auth::{AccessClaims, RequestContext};
use wiseup_core::CorrelationId;
use wiseup_telemetry::with_correlation;

use crate::error::ApiError;
use crate::server::AppState;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Tag every request with a correlation id: the incoming `x-correlation-id`
/// when present, a fresh one otherwise. The id is the task-local correlation id
/// for the whole handler and is echoed on the response.
pub async fn correlation_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(CORRELATION_HEADER);

    let id = req
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(CorrelationId::new)
        .unwrap_or_else(CorrelationId::generate);

    req.extensions_mut().insert(id.clone());

    let mut res = with_correlation(id.clone(), next.run(req)).await;

    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        res.headers_mut().insert(header_name, value);
    }
    res
}

/// Caller source for rate limiting: the first `x-forwarded-for` hop, else the
/// peer address when the server was started with connect info.
#[derive(Debug, Clone, Default)]
pub struct ClientSource(pub Option<String>);

impl ClientSource {
    pub fn context(&self) -> RequestContext {
        RequestContext {
            source: self.0.clone(),
            user_hint: None,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientSource {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if forwarded.is_some() {
            return Ok(Self(forwarded));
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(peer))
    }
}

/// Verified claims of the `Authorization: Bearer` access token.
#[derive(Debug, Clone)]
pub struct Authenticated(pub AccessClaims);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;

        let token = match header.strip_prefix("Bearer ") {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Err(ApiError::Unauthorized(
                    "invalid Authorization header format".into(),
                ));
            }
        };

        let claims = state.services.tokens.access_tokens().verify(token)?;
        Ok(Self(claims))
    }
}
