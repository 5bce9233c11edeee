use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Type of token lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    /// Credential accepted and a new family issued
    LoginSucceeded,
    /// Credential rejected by the identity authority
    LoginFailed,
    /// A new token family was issued
    SessionIssued,
    /// Refresh token rotated to a successor
    TokenRotated,
    /// Rotation rejected (unknown, expired or revoked token)
    RotationFailed,
    /// A rotated-away token was presented again; family revoked
    ReuseDetected,
    /// Rotation refused by the rate limiter
    RateLimited,
    /// Family revoked explicitly
    SessionRevoked,
    /// Family reached its absolute expiry
    SessionExpired,
}

impl AuthEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventType::LoginSucceeded => "login_succeeded",
            AuthEventType::LoginFailed => "login_failed",
            AuthEventType::SessionIssued => "session_issued",
            AuthEventType::TokenRotated => "token_rotated",
            AuthEventType::RotationFailed => "rotation_failed",
            AuthEventType::ReuseDetected => "reuse_detected",
            AuthEventType::RateLimited => "rate_limited",
            AuthEventType::SessionRevoked => "session_revoked",
            AuthEventType::SessionExpired => "session_expired",
        }
    }

    /// Whether the event counts as a failed authentication attempt.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AuthEventType::LoginFailed
                | AuthEventType::RotationFailed
                | AuthEventType::ReuseDetected
                | AuthEventType::RateLimited
        )
    }

    /// Whether the event counts as a successful authentication attempt.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            AuthEventType::LoginSucceeded | AuthEventType::TokenRotated
        )
    }
}

impl std::fmt::Display for AuthEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event describing one step of a session's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    pub event_type: AuthEventType,
    /// User ID (if known)
    pub user_id: Option<String>,
    /// Token family (if applicable)
    pub family_id: Option<String>,
    /// Caller-supplied source identifier (client address, device id)
    pub source: Option<String>,
    /// Failure or revocation reason
    pub reason: Option<String>,
    /// Correlation id of the request that produced the event
    pub correlation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AuthEvent {
    pub fn new(event_type: AuthEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            family_id: None,
            source: None,
            reason: None,
            correlation_id: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn login_failed(source: Option<String>, reason: impl Into<String>) -> Self {
        Self::new(AuthEventType::LoginFailed)
            .with_source(source)
            .with_reason(reason)
    }

    pub fn session_issued(user_id: impl Into<String>, family_id: impl Into<String>) -> Self {
        Self::new(AuthEventType::SessionIssued)
            .with_user(user_id)
            .with_family(family_id)
    }

    pub fn token_rotated(user_id: impl Into<String>, family_id: impl Into<String>) -> Self {
        Self::new(AuthEventType::TokenRotated)
            .with_user(user_id)
            .with_family(family_id)
    }

    pub fn reuse_detected(user_id: impl Into<String>, family_id: impl Into<String>) -> Self {
        Self::new(AuthEventType::ReuseDetected)
            .with_user(user_id)
            .with_family(family_id)
            .with_reason("refresh token reuse")
    }

    pub fn session_revoked(
        user_id: impl Into<String>,
        family_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(AuthEventType::SessionRevoked)
            .with_user(user_id)
            .with_family(family_id)
            .with_reason(reason)
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_family(mut self, family_id: impl Into<String>) -> Self {
        self.family_id = Some(family_id.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_classification() {
        assert!(AuthEventType::ReuseDetected.is_failure());
        assert!(AuthEventType::TokenRotated.is_success());
        assert!(!AuthEventType::SessionRevoked.is_failure());
        assert!(!AuthEventType::SessionRevoked.is_success());
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = AuthEvent::reuse_detected("user-1", "fam-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "reuse_detected");
        assert_eq!(json["family_id"], "fam-1");
        assert!(json["timestamp"].is_string());
    }
}
