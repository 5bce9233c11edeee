//! Session core authentication errors.

use std::time::Duration;
use wiseup_cache::CacheError;
use wiseup_storage::StoreError;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// A rotated-away or revoked token was presented. The whole family has
    /// been revoked; the user must sign in again.
    #[error("refresh token reuse detected; family {family_id} revoked")]
    TokenReuseDetected { family_id: String },

    /// Too many attempts. Retry after the given delay.
    #[error("rate limited; retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("invalid token: {message}")]
    InvalidToken { message: String },

    #[error("token revoked")]
    TokenRevoked,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AuthError {
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The caller's session is gone and the user must authenticate from
    /// scratch.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::TokenReuseDetected { .. }
                | Self::TokenRevoked
                | Self::TokenExpired
                | Self::InvalidToken { .. }
                | Self::InvalidCredential
        )
    }

    /// Infrastructure fault; the request can be retried as-is.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Cache(e) => !matches!(e, CacheError::Serialization(_)),
            _ => false,
        }
    }

    /// Short machine-readable code for API responses and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenReuseDetected { .. } => "token_reuse_detected",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidToken { .. } => "invalid_token",
            Self::TokenRevoked => "token_revoked",
            Self::TokenExpired => "token_expired",
            Self::InvalidCredential => "invalid_credential",
            Self::Storage(_) => "storage_unavailable",
            Self::Cache(_) => "cache_unavailable",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            _ => Self::invalid_token(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reauthentication_classification() {
        assert!(AuthError::TokenReuseDetected { family_id: "f".into() }.requires_reauthentication());
        assert!(AuthError::TokenRevoked.requires_reauthentication());
        assert!(!AuthError::RateLimited { retry_after: Duration::from_secs(1) }.requires_reauthentication());
        assert!(!AuthError::Storage(StoreError::timeout(5)).requires_reauthentication());
        assert!(AuthError::Storage(StoreError::timeout(5)).is_transient());
    }
}
