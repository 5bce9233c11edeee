//! # wiseup-auth
//!
//! Session lifecycle for the WiseUp core.
//!
//! - [`TokenLifecycleService`]: issue, rotate and revoke refresh tokens.
//!   Token families are linearized per family; presenting a rotated-away
//!   token revokes the whole family.
//! - [`RateLimiter`]: minute/hour/day windows with lockout, shared across
//!   instances through the cache tier
//! - [`IdentityAuthority`]: the external credential check, with an Argon2
//!   backed [`LocalIdentityAuthority`]
//! - [`AuthMonitor`]: failure-rate windows and anomaly alerts fed from the
//!   auth event bus
//!
//! ## Example
//!
//! ```ignore
//! let service = TokenLifecycleService::new(tokens, limits, store, cache, events, hub)
//!     .with_identity(Arc::new(authority))
//!     .with_audit(batch_writer);
//!
//! let pair = service.login(&Credential::new("alice", "pw"), &ctx).await?;
//! match service.refresh(&pair.refresh_token, &ctx).await {
//!     Ok(next) => { /* hand out next */ }
//!     Err(e) if e.requires_reauthentication() => { /* force logout */ }
//!     Err(e) => return Err(e),
//! }
//! ```

mod config;
mod error;
pub mod identity;
pub mod monitor;
mod rate_limit;
pub mod repository;
mod service;
pub mod token;

pub use config::{MonitorConfig, RateLimitConfig, TokenConfig};
pub use error::{AuthError, AuthResult};
pub use identity::{
    AccessClaims, AccessTokenIssuer, Credential, DynIdentityAuthority, IdentityAuthority,
    LocalIdentityAuthority,
};
pub use monitor::{
    Anomaly, AnomalyKind, AttemptContext, AttemptOutcome, AuthMonitor, MonitorHealth, SecurityEvent,
    SecurityEventKind, SecurityReport, SubjectCount,
};
pub use rate_limit::RateLimiter;
pub use service::{
    AUDIT_TABLE, AUTH_STATS_TABLE, REASON_REUSE, RequestContext, RevokeTarget,
    TokenLifecycleService, TokenPair, TokenStats,
};
pub use token::{
    FamilyState, IssuedToken, RefreshToken, SessionInfo, TokenFamily, TokenState, hash_token,
};
