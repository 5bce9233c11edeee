//! HTTP error responses.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use wiseup_auth::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or unusable access token.
    #[error("authentication required: {0}")]
    Unauthorized(String),

    #[error("access forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Auth(e) if e.requires_reauthentication() => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::Storage(_) | AuthError::Cache(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reauthenticate = matches!(&self, Self::Auth(e) if e.requires_reauthentication());

        if status.is_server_error() {
            tracing::warn!(error = %self, code = self.code(), "request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "request rejected");
        }

        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "reauthenticate": reauthenticate,
        });
        let mut response = (status, Json(body)).into_response();

        if let Self::Auth(AuthError::RateLimited { retry_after }) = &self {
            // Round up so clients never retry inside the lockout.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiseup_storage::StoreError;

    #[test]
    fn test_status_mapping() {
        let reuse = ApiError::from(AuthError::TokenReuseDetected {
            family_id: "f-1".into(),
        });
        assert_eq!(reuse.status(), StatusCode::UNAUTHORIZED);

        let limited = ApiError::from(AuthError::RateLimited {
            retry_after: Duration::from_secs(30),
        });
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let store = ApiError::from(AuthError::Storage(StoreError::timeout(100)));
        assert_eq!(store.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(AuthError::RateLimited {
            retry_after: Duration::from_millis(1500),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");
    }
}
