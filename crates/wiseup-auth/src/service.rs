//! Token Lifecycle Service.
//!
//! Per family the state machine is `ACTIVE(jti) -> ROTATED(jti -> jti') -> ...`
//! with terminal `REVOKED` and `EXPIRED`. Presenting any jti of a family that
//! is no longer its active jti revokes the whole family.
//!
//! Rotations of one family are serialized by a per-family lock inside the
//! process and by compare-and-put on the family row across processes. The
//! family write is the commit point: the successor token is only handed out
//! once the family row names it as the active jti.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wiseup_batch::{BatchWriter, Mutation};
use wiseup_cache::CacheTierManager;
use wiseup_core::{AuthEvent, AuthEventBus, AuthEventType};
use wiseup_storage::{DynStore, StoreError};
use wiseup_telemetry::names::*;
use wiseup_telemetry::{EventLevel, ObservabilityHub, current_correlation_id};

use crate::config::{RateLimitConfig, TokenConfig};
use crate::error::{AuthError, AuthResult};
use crate::identity::{AccessTokenIssuer, Credential, DynIdentityAuthority};
use crate::rate_limit::RateLimiter;
use crate::repository::FamilyRepository;
use crate::token::{
    ChainLink, FamilyState, IssuedToken, RefreshToken, SessionInfo, TokenFamily, TokenRecord,
    TokenState, generate_token, hash_token,
};

pub const AUDIT_TABLE: &str = "auth_audit";
pub const AUTH_STATS_TABLE: &str = "auth_stats";

/// Revocation reason recorded when a family is revoked for token reuse.
pub const REASON_REUSE: &str = "reuse_detected";

const REVOKE_RETRIES: usize = 8;

/// Caller information used for rate limiting, events and audit rows.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Client address or device identifier.
    pub source: Option<String>,
    /// User the caller claims to be, if known before the token is resolved.
    pub user_hint: Option<String>,
}

impl RequestContext {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            user_hint: None,
        }
    }

    #[must_use]
    pub fn with_user_hint(mut self, user_id: impl Into<String>) -> Self {
        self.user_hint = Some(user_id.into());
        self
    }
}

/// Response of login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub refresh_token: String,
    pub refresh_jti: String,
    pub family_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeTarget {
    /// Revoke the family the jti belongs to.
    Token(String),
    Family(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub issued: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub rotations: u64,
    pub revocations: u64,
    pub reuse_detections: u64,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    rotations: AtomicU64,
    revocations: AtomicU64,
    reuse_detections: AtomicU64,
}

/// In-process single-writer lock per family. Entries are dropped once no
/// task holds or waits for them.
#[derive(Default)]
struct FamilyLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

struct FamilyGuard<'a> {
    locks: &'a FamilyLocks,
    family_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl FamilyLocks {
    async fn acquire(&self, family_id: &str) -> FamilyGuard<'_> {
        let lock = Arc::clone(self.locks.entry(family_id.to_string()).or_default().value());
        let guard = Arc::clone(&lock).lock_owned().await;
        FamilyGuard {
            locks: self,
            family_id: family_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for FamilyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Map entry plus our own handle: nobody else is waiting.
        self.locks.locks.remove_if(&self.family_id, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

pub struct TokenLifecycleService {
    config: TokenConfig,
    repo: FamilyRepository,
    limiter: RateLimiter,
    access: AccessTokenIssuer,
    identity: Option<DynIdentityAuthority>,
    events: Arc<AuthEventBus>,
    hub: Arc<ObservabilityHub>,
    audit: Option<Arc<BatchWriter>>,
    locks: FamilyLocks,
    counters: Counters,
}

impl TokenLifecycleService {
    pub fn new(
        config: TokenConfig,
        rate_limits: RateLimitConfig,
        store: DynStore,
        cache: Arc<CacheTierManager>,
        events: Arc<AuthEventBus>,
        hub: Arc<ObservabilityHub>,
    ) -> Self {
        Self {
            access: AccessTokenIssuer::new(&config.jwt_secret, config.issuer.clone(), config.access_ttl),
            repo: FamilyRepository::new(store, Arc::clone(&cache), config.clone()),
            limiter: RateLimiter::new(cache, rate_limits),
            config,
            identity: None,
            events,
            hub,
            audit: None,
            locks: FamilyLocks::default(),
            counters: Counters::default(),
        }
    }

    pub fn with_identity(mut self, identity: DynIdentityAuthority) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Audit rows and per-action counters go through this writer.
    pub fn with_audit(mut self, writer: Arc<BatchWriter>) -> Self {
        self.audit = Some(writer);
        self
    }

    pub fn access_tokens(&self) -> &AccessTokenIssuer {
        &self.access
    }

    pub fn events(&self) -> &Arc<AuthEventBus> {
        &self.events
    }

    /// Validate a credential with the identity authority and open a new
    /// session.
    pub async fn login(&self, credential: &Credential, ctx: &RequestContext) -> AuthResult<TokenPair> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| AuthError::internal("no identity authority configured"))?;

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let mut keys = limit_keys(ctx);
        keys.push(format!("login:{}", credential.username));
        if let Err(e) = self.limiter.check(&keys).await {
            self.record_failure(&e, ctx);
            return Err(e);
        }

        let user_id = match identity.validate_credential(credential).await {
            Ok(user_id) => user_id,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    AuthEvent::login_failed(ctx.source.clone(), e.code())
                        .with_user(credential.username.clone()),
                );
                return Err(e);
            }
        };

        let issued = self.issue(&user_id, ctx).await?;
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        self.publish(
            AuthEvent::new(AuthEventType::LoginSucceeded)
                .with_user(user_id.clone())
                .with_family(issued.refresh.family_id.clone())
                .with_source(ctx.source.clone()),
        );
        self.token_pair(issued)
    }

    /// Rotate a refresh token and mint a fresh access token.
    pub async fn refresh(&self, token: &str, ctx: &RequestContext) -> AuthResult<TokenPair> {
        let issued = self.rotate(token, ctx).await?;
        self.token_pair(issued)
    }

    fn token_pair(&self, issued: IssuedToken) -> AuthResult<TokenPair> {
        let (access_token, _) = self
            .access
            .issue(&issued.refresh.user_id, &issued.refresh.family_id)?;
        Ok(TokenPair {
            access_token,
            token_type: "Bearer",
            expires_in: self.access.ttl().as_secs(),
            refresh_token: issued.token,
            refresh_jti: issued.refresh.jti,
            family_id: issued.refresh.family_id,
            refresh_expires_at: issued.expires_at,
        })
    }

    /// Start a new token family for `user_id`.
    pub async fn issue(&self, user_id: &str, ctx: &RequestContext) -> AuthResult<IssuedToken> {
        let now = OffsetDateTime::now_utc();
        let family_id = Uuid::new_v4().to_string();
        let jti = Uuid::new_v4().to_string();
        let secret = generate_token();
        let token_hash = hash_token(&secret);

        let record = TokenRecord {
            jti: jti.clone(),
            user_id: user_id.to_string(),
            family_id: family_id.clone(),
            issued_at: now,
            rotated_from: None,
        };
        self.repo.put_token(&token_hash, &record).await?;

        let mut family = TokenFamily {
            family_id: family_id.clone(),
            user_id: user_id.to_string(),
            active_jti: Some(jti.clone()),
            active_jti_hash: Some(token_hash),
            chain: vec![ChainLink {
                jti: jti.clone(),
                issued_at: now,
            }],
            created_at: now,
            expires_at: now + self.config.refresh_ttl,
            state: FamilyState::Active,
            revoked_at: None,
            revocation_reason: None,
            version: 0,
        };
        self.repo.create_family(&mut family).await?;

        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        self.hub.metrics().increment(TOKEN_ISSUED_TOTAL, &[]);
        self.publish(AuthEvent::session_issued(user_id, &family_id).with_source(ctx.source.clone()));
        self.audit("issue", &family, Some(&jti), None, ctx).await;
        debug!(user_id = %user_id, family_id = %family_id, "token family issued");

        Ok(IssuedToken {
            token: secret,
            refresh: to_refresh_token(&record, false),
            expires_at: family.expires_at,
        })
    }

    /// Exchange the active refresh token of a family for its successor.
    ///
    /// # Errors
    ///
    /// - `RateLimited` before any lookup when the source, user or token is
    ///   over its limits
    /// - `InvalidToken` for an unknown token
    /// - `TokenReuseDetected` when the token is not the active jti of its
    ///   family; the family is revoked
    /// - `TokenRevoked` / `TokenExpired` for a finished family
    /// - `Storage` / `Cache` when persistence failed; the presented token
    ///   stays active
    pub async fn rotate(&self, token: &str, ctx: &RequestContext) -> AuthResult<IssuedToken> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        self.hub.metrics().increment(TOKEN_ROTATION_ATTEMPTS_TOTAL, &[]);
        let started = Instant::now();

        let result = self.hub.in_span("token.rotate", self.rotate_inner(token, ctx)).await;

        self.hub
            .metrics()
            .observe_duration(TOKEN_ROTATION_DURATION_MS, started.elapsed(), &[]);
        match &result {
            Ok(issued) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.counters.rotations.fetch_add(1, Ordering::Relaxed);
                self.hub.metrics().increment(TOKEN_ROTATIONS_TOTAL, &[]);
                self.publish(
                    AuthEvent::token_rotated(&issued.refresh.user_id, &issued.refresh.family_id)
                        .with_source(ctx.source.clone()),
                );
            }
            Err(e) => self.record_failure(e, ctx),
        }
        result
    }

    async fn rotate_inner(&self, token: &str, ctx: &RequestContext) -> AuthResult<IssuedToken> {
        let token_hash = hash_token(token);

        // 1. Throttle before touching cache or store
        let mut keys = limit_keys(ctx);
        keys.push(format!("token:{token_hash}"));
        self.limiter.check(&keys).await?;

        // 2. Resolve the token
        let record = self
            .repo
            .find_by_hash(&token_hash)
            .await?
            .ok_or_else(|| AuthError::invalid_token("unknown refresh token"))?;

        // Per-user windows count every rotation of the user's tokens,
        // whichever source presents them.
        if ctx.user_hint.as_deref() != Some(record.user_id.as_str()) {
            self.limiter
                .check(&[format!("user:{}", record.user_id)])
                .await?;
        }

        // 3. Single writer per family; read the row we are going to replace
        let _guard = self.locks.acquire(&record.family_id).await;
        let mut family = self
            .repo
            .load_family(&record.family_id)
            .await?
            .ok_or_else(|| AuthError::invalid_token("token family not found"))?;

        let now = OffsetDateTime::now_utc();
        match family.token_state(&record.jti, now) {
            TokenState::Active => {}
            TokenState::Rotated => {
                self.revoke_for_reuse(&record, ctx).await?;
                return Err(AuthError::TokenReuseDetected {
                    family_id: record.family_id,
                });
            }
            TokenState::Revoked => {
                return Err(match family.revocation_reason.as_deref() {
                    Some(REASON_REUSE) => AuthError::TokenReuseDetected {
                        family_id: record.family_id,
                    },
                    _ => AuthError::TokenRevoked,
                });
            }
            TokenState::Expired => {
                self.expire_family(&mut family, ctx).await;
                return Err(AuthError::TokenExpired);
            }
        }

        // 4. Mint the successor and index it; not reachable until committed
        let jti = Uuid::new_v4().to_string();
        let secret = generate_token();
        let new_hash = hash_token(&secret);
        let successor = TokenRecord {
            jti: jti.clone(),
            user_id: record.user_id.clone(),
            family_id: record.family_id.clone(),
            issued_at: now,
            rotated_from: Some(record.jti.clone()),
        };
        self.repo.put_token(&new_hash, &successor).await?;

        // 5. Commit: move the family's active pointer
        family.rotate_to(&jti, &new_hash, now);
        if let Err(e) = self.repo.update_family(&mut family).await {
            if e.is_version_conflict() {
                return Err(self.lost_commit(&record, e, ctx).await);
            }
            warn!(family_id = %record.family_id, error = %e, "rotation not committed");
            return Err(e.into());
        }

        self.audit("rotate", &family, Some(&jti), None, ctx).await;
        debug!(family_id = %family.family_id, jti = %jti, "refresh token rotated");

        Ok(IssuedToken {
            token: secret,
            refresh: to_refresh_token(&successor, false),
            expires_at: family.expires_at,
        })
    }

    /// Classify a rotation whose family write lost to another writer, by
    /// what that writer left in the row.
    async fn lost_commit(
        &self,
        record: &TokenRecord,
        conflict: StoreError,
        ctx: &RequestContext,
    ) -> AuthError {
        let family = match self.repo.load_family(&record.family_id).await {
            Ok(Some(family)) => family,
            Ok(None) => return AuthError::invalid_token("token family not found"),
            Err(e) => return e,
        };
        match family.token_state(&record.jti, OffsetDateTime::now_utc()) {
            // Rotated elsewhere: the presented token is now a reused one.
            TokenState::Rotated => match self.revoke_for_reuse(record, ctx).await {
                Ok(()) => AuthError::TokenReuseDetected {
                    family_id: record.family_id.clone(),
                },
                Err(e) => e,
            },
            TokenState::Revoked => match family.revocation_reason.as_deref() {
                Some(REASON_REUSE) => AuthError::TokenReuseDetected {
                    family_id: record.family_id.clone(),
                },
                _ => AuthError::TokenRevoked,
            },
            TokenState::Expired => AuthError::TokenExpired,
            // Row changed but still names this token; the caller may retry.
            TokenState::Active => {
                warn!(family_id = %record.family_id, "rotation raced a non-rotating family update");
                AuthError::Storage(conflict)
            }
        }
    }

    /// Revoke the family of a reused token. Retries on concurrent updates
    /// until the family is revoked.
    async fn revoke_for_reuse(&self, record: &TokenRecord, ctx: &RequestContext) -> AuthResult<()> {
        let revoked = self.revoke_family(&record.family_id, REASON_REUSE, ctx).await?;
        if revoked {
            self.counters.reuse_detections.fetch_add(1, Ordering::Relaxed);
            self.hub.metrics().increment(TOKEN_REUSE_DETECTED_TOTAL, &[]);
            self.publish(
                AuthEvent::reuse_detected(&record.user_id, &record.family_id)
                    .with_source(ctx.source.clone()),
            );
            self.hub.record_event(
                EventLevel::Warn,
                "refresh token reuse detected; family revoked",
                &[
                    ("family_id", record.family_id.clone()),
                    ("user_id", record.user_id.clone()),
                    ("jti", record.jti.clone()),
                ],
            );
        }
        Ok(())
    }

    async fn expire_family(&self, family: &mut TokenFamily, ctx: &RequestContext) {
        if family.state != FamilyState::Active {
            return;
        }
        family.expire();
        match self.repo.update_family(family).await {
            Ok(()) => {
                self.publish(
                    AuthEvent::new(AuthEventType::SessionExpired)
                        .with_user(family.user_id.clone())
                        .with_family(family.family_id.clone())
                        .with_source(ctx.source.clone()),
                );
                self.audit("expire", family, None, None, ctx).await;
            }
            // Expiry is derived from `expires_at` anyway; the row is updated
            // on a later attempt.
            Err(e) => debug!(family_id = %family.family_id, error = %e, "family expiry not recorded"),
        }
    }

    /// Revoke a family or the family of a jti. Returns `false` when nothing
    /// active was found.
    pub async fn revoke(&self, target: RevokeTarget, reason: &str) -> AuthResult<bool> {
        let family_id = match target {
            RevokeTarget::Family(id) => id,
            RevokeTarget::Token(jti) => match self.repo.find_by_jti(&jti).await? {
                Some(record) => record.family_id,
                None => return Ok(false),
            },
        };
        self.revoke_family(&family_id, reason, &RequestContext::default())
            .await
    }

    /// Revoke every active family of a user. Returns how many were revoked.
    pub async fn revoke_all_for_user(&self, user_id: &str, reason: &str) -> AuthResult<usize> {
        let ctx = RequestContext::default();
        let mut revoked = 0;
        for family_id in self.repo.user_families(user_id).await? {
            if self.revoke_family(&family_id, reason, &ctx).await? {
                revoked += 1;
            }
        }
        self.repo.invalidate_user(user_id).await;
        info!(user_id = %user_id, revoked, reason = %reason, "revoked all sessions for user");
        Ok(revoked)
    }

    async fn revoke_family(&self, family_id: &str, reason: &str, ctx: &RequestContext) -> AuthResult<bool> {
        for _ in 0..REVOKE_RETRIES {
            let Some(mut family) = self.repo.load_family(family_id).await? else {
                return Ok(false);
            };
            if family.state != FamilyState::Active {
                return Ok(false);
            }
            family.revoke(reason, OffsetDateTime::now_utc());
            match self.repo.update_family(&mut family).await {
                Ok(()) => {
                    self.counters.revocations.fetch_add(1, Ordering::Relaxed);
                    self.hub
                        .metrics()
                        .increment(TOKEN_REVOCATIONS_TOTAL, &[("reason", reason_label(reason))]);
                    self.publish(
                        AuthEvent::session_revoked(&family.user_id, family_id, reason)
                            .with_source(ctx.source.clone()),
                    );
                    self.audit("revoke", &family, None, Some(reason), ctx).await;
                    info!(family_id = %family_id, reason = %reason, "token family revoked");
                    return Ok(true);
                }
                Err(e) if e.is_version_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::internal(format!(
            "family {family_id} kept changing during revocation"
        )))
    }

    /// Whether `jti` is the active token of a live family. Served from the
    /// cache; revocations invalidate it on every instance.
    pub async fn is_active(&self, jti: &str) -> AuthResult<bool> {
        let Some(record) = self.repo.find_by_jti(jti).await? else {
            return Ok(false);
        };
        let Some(family) = self.repo.cached_family(&record.family_id).await? else {
            return Ok(false);
        };
        Ok(family.is_active_jti(jti, OffsetDateTime::now_utc()))
    }

    /// Public view of a token by jti.
    pub async fn find_token(&self, jti: &str) -> AuthResult<Option<RefreshToken>> {
        let Some(record) = self.repo.find_by_jti(jti).await? else {
            return Ok(None);
        };
        let revoked = match self.repo.cached_family(&record.family_id).await? {
            Some(family) => family.state == FamilyState::Revoked,
            None => true,
        };
        Ok(Some(to_refresh_token(&record, revoked)))
    }

    /// Live sessions of a user, oldest first.
    pub async fn list_sessions(&self, user_id: &str) -> AuthResult<Vec<SessionInfo>> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = Vec::new();
        for family_id in self.repo.cached_user_families(user_id).await? {
            if let Some(family) = self.repo.load_family(&family_id).await? {
                if family.state == FamilyState::Active && !family.is_expired(now) {
                    sessions.push(SessionInfo::from(&family));
                }
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn stats(&self) -> TokenStats {
        let c = &self.counters;
        TokenStats {
            issued: c.issued.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            rotations: c.rotations.load(Ordering::Relaxed),
            revocations: c.revocations.load(Ordering::Relaxed),
            reuse_detections: c.reuse_detections.load(Ordering::Relaxed),
        }
    }

    /// Families currently holding an in-process rotation lock.
    pub fn locked_families(&self) -> usize {
        self.locks.len()
    }

    fn record_failure(&self, error: &AuthError, ctx: &RequestContext) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        match error {
            AuthError::RateLimited { .. } => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                self.hub.metrics().increment(TOKEN_RATE_LIMITED_TOTAL, &[]);
                let mut event = AuthEvent::new(AuthEventType::RateLimited)
                    .with_source(ctx.source.clone())
                    .with_reason(error.code());
                if let Some(user) = &ctx.user_hint {
                    event = event.with_user(user.clone());
                }
                self.publish(event);
            }
            // Counted and published where the family was revoked.
            AuthError::TokenReuseDetected { .. } => {}
            other => {
                self.hub
                    .metrics()
                    .increment(TOKEN_ROTATION_FAILURES_TOTAL, &[("reason", other.code())]);
                let mut event = AuthEvent::new(AuthEventType::RotationFailed)
                    .with_source(ctx.source.clone())
                    .with_reason(other.code());
                if let Some(user) = &ctx.user_hint {
                    event = event.with_user(user.clone());
                }
                self.publish(event);
            }
        }
    }

    fn publish(&self, event: AuthEvent) {
        let correlation = current_correlation_id().map(|c| c.as_str().to_string());
        self.events.publish(event.with_correlation(correlation));
    }

    /// Best effort: an audit row that cannot be queued is logged, the
    /// operation itself has already succeeded.
    async fn audit(
        &self,
        action: &str,
        family: &TokenFamily,
        jti: Option<&str>,
        reason: Option<&str>,
        ctx: &RequestContext,
    ) {
        let Some(writer) = &self.audit else {
            return;
        };
        let row = json!({
            "action": action,
            "user_id": family.user_id,
            "family_id": family.family_id,
            "jti": jti,
            "reason": reason,
            "source": ctx.source,
            "correlation_id": current_correlation_id().map(|c| c.as_str().to_string()),
            "at": OffsetDateTime::now_utc().unix_timestamp(),
        });
        let mutations = [
            Mutation::insert(AUDIT_TABLE, Uuid::new_v4().to_string(), row),
            Mutation::increment(AUTH_STATS_TABLE, action, 1),
        ];
        for mutation in mutations {
            if let Err(e) = writer.enqueue(mutation).await {
                warn!(action = %action, family_id = %family.family_id, error = %e, "audit row not queued");
            }
        }
    }
}

fn limit_keys(ctx: &RequestContext) -> Vec<String> {
    let mut keys = Vec::with_capacity(3);
    if let Some(source) = &ctx.source {
        keys.push(format!("src:{source}"));
    }
    if let Some(user) = &ctx.user_hint {
        keys.push(format!("user:{user}"));
    }
    keys
}

fn reason_label(reason: &str) -> &'static str {
    match reason {
        REASON_REUSE => "reuse",
        "logout" => "logout",
        _ => "other",
    }
}

fn to_refresh_token(record: &TokenRecord, revoked: bool) -> RefreshToken {
    RefreshToken {
        jti: record.jti.clone(),
        user_id: record.user_id.clone(),
        family_id: record.family_id.clone(),
        issued_at: record.issued_at,
        rotated_from: record.rotated_from.clone(),
        revoked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentityAuthority;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use wiseup_cache::CacheConfig;
    use wiseup_core::InstanceId;
    use wiseup_storage::{
        AuthoritativeStore, BatchOutcome, MemoryStore, MutationBatch, StoreError, StoredRow,
    };
    use wiseup_telemetry::{AggregatorConfig, MetricsAggregator};

    struct Fixture {
        service: Arc<TokenLifecycleService>,
        store: Arc<MemoryStore>,
        events: Arc<AuthEventBus>,
    }

    fn build(config: TokenConfig, limits: RateLimitConfig, store: DynStore) -> TokenLifecycleService {
        build_with_cache(config, limits, store).0
    }

    fn build_with_cache(
        config: TokenConfig,
        limits: RateLimitConfig,
        store: DynStore,
    ) -> (TokenLifecycleService, Arc<CacheTierManager>) {
        let instance = InstanceId::generate();
        let metrics = MetricsAggregator::new_shared(AggregatorConfig::default());
        let cache = Arc::new(CacheTierManager::new(
            instance.clone(),
            CacheConfig::default(),
            Arc::clone(&metrics),
        ));
        let hub = Arc::new(ObservabilityHub::new(instance, metrics));
        let service = TokenLifecycleService::new(
            config,
            limits,
            store,
            Arc::clone(&cache),
            AuthEventBus::new_shared(),
            hub,
        );
        (service, cache)
    }

    fn fixture_with(config: TokenConfig, limits: RateLimitConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let service = build(config, limits, store.clone());
        let events = Arc::clone(service.events());
        Fixture {
            service: Arc::new(service),
            store,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            TokenConfig {
                jwt_secret: "test-secret".into(),
                ..TokenConfig::default()
            },
            RateLimitConfig::default(),
        )
    }

    /// Memory store whose family writes can be made to fail, or be
    /// preceded by a revocation from another writer.
    struct FlakyFamilyStore {
        inner: MemoryStore,
        fail_family_writes: AtomicBool,
        revoke_before_next_update: AtomicBool,
    }

    impl FlakyFamilyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_family_writes: AtomicBool::new(false),
                revoke_before_next_update: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AuthoritativeStore for FlakyFamilyStore {
        async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>, StoreError> {
            self.inner.get(table, key).await
        }

        async fn put(&self, table: &str, key: &str, value: Value) -> Result<u64, StoreError> {
            self.inner.put(table, key, value).await
        }

        async fn compare_and_put(
            &self,
            table: &str,
            key: &str,
            expected: Option<u64>,
            value: Value,
        ) -> Result<u64, StoreError> {
            if table == "token_family" && self.fail_family_writes.load(Ordering::SeqCst) {
                return Err(StoreError::timeout(250));
            }
            if table == "token_family"
                && expected.is_some()
                && self.revoke_before_next_update.swap(false, Ordering::SeqCst)
            {
                let row = self.inner.get(table, key).await?.unwrap();
                let mut revoked = row.value;
                revoked["state"] = json!("revoked");
                revoked["active_jti"] = Value::Null;
                revoked["active_jti_hash"] = Value::Null;
                revoked["revocation_reason"] = json!("logout");
                self.inner.put(table, key, revoked).await?;
            }
            self.inner.compare_and_put(table, key, expected, value).await
        }

        async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(table, key).await
        }

        async fn apply_batch(&self, batch: &MutationBatch) -> Result<BatchOutcome, StoreError> {
            self.inner.apply_batch(batch).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_rotate_then_reuse_revokes_family() {
        let f = fixture();
        let ctx = RequestContext::from_source("10.0.0.1");
        let a = f.service.issue("user-1", &ctx).await.unwrap();
        let b = f.service.rotate(&a.token, &ctx).await.unwrap();

        assert_eq!(b.refresh.family_id, a.refresh.family_id);
        assert_eq!(b.refresh.rotated_from.as_deref(), Some(a.refresh.jti.as_str()));
        assert!(!f.service.is_active(&a.refresh.jti).await.unwrap());
        assert!(f.service.is_active(&b.refresh.jti).await.unwrap());

        let reuse = f.service.rotate(&a.token, &ctx).await;
        assert!(matches!(reuse, Err(AuthError::TokenReuseDetected { .. })));
        assert!(!f.service.is_active(&b.refresh.jti).await.unwrap());

        // The legitimate successor is dead too.
        let after = f.service.rotate(&b.token, &ctx).await;
        assert!(matches!(after, Err(AuthError::TokenReuseDetected { .. })));

        let stats = f.service.stats();
        assert_eq!(stats.rotations, 1);
        assert_eq!(stats.reuse_detections, 1);
        assert_eq!(stats.revocations, 1);
    }

    #[tokio::test]
    async fn test_concurrent_rotation_of_same_token_has_one_winner() {
        let f = fixture();
        let a = f.service.issue("user-1", &RequestContext::default()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&f.service);
            let token = a.token.clone();
            handles.push(tokio::spawn(async move {
                service.rotate(&token, &RequestContext::default()).await
            }));
        }
        let mut ok = 0;
        let mut reuse = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AuthError::TokenReuseDetected { .. }) => reuse += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(reuse, 7);
        assert_eq!(f.service.locked_families(), 0);

        // Reuse revoked the family: nothing is active.
        let family = f.store.get("token_family", &a.refresh.family_id).await.unwrap().unwrap();
        assert_eq!(family.value["state"], "revoked");
        assert!(family.value["active_jti"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let f = fixture();
        let result = f.service.rotate("not-a-token", &RequestContext::default()).await;
        assert!(matches!(result, Err(AuthError::InvalidToken { .. })));
        assert_eq!(f.service.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_old_token_active() {
        let store = Arc::new(FlakyFamilyStore::new());
        let service = build(TokenConfig::default(), RateLimitConfig::default(), store.clone());
        let ctx = RequestContext::default();
        let a = service.issue("user-1", &ctx).await.unwrap();

        store.fail_family_writes.store(true, Ordering::SeqCst);
        let err = service.rotate(&a.token, &ctx).await.unwrap_err();
        assert!(err.is_transient());
        store.fail_family_writes.store(false, Ordering::SeqCst);

        assert!(service.is_active(&a.refresh.jti).await.unwrap());
        let b = service.rotate(&a.token, &ctx).await.unwrap();
        assert!(service.is_active(&b.refresh.jti).await.unwrap());
        assert!(!service.is_active(&a.refresh.jti).await.unwrap());
    }

    #[tokio::test]
    async fn test_revocation_racing_rotation_is_not_reuse() {
        let store = Arc::new(FlakyFamilyStore::new());
        let service = build(TokenConfig::default(), RateLimitConfig::default(), store.clone());
        let ctx = RequestContext::default();
        let a = service.issue("user-1", &ctx).await.unwrap();

        // A logout lands between the rotation's read and its commit.
        store.revoke_before_next_update.store(true, Ordering::SeqCst);
        let result = service.rotate(&a.token, &ctx).await;
        assert!(matches!(result, Err(AuthError::TokenRevoked)), "{result:?}");

        let stats = service.stats();
        assert_eq!(stats.reuse_detections, 0);
        assert_eq!(stats.rotations, 0);
        let family = store
            .get("token_family", &a.refresh.family_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.value["revocation_reason"], "logout");
    }

    #[tokio::test]
    async fn test_user_rotation_limit_spans_sources() {
        let f = fixture_with(
            TokenConfig::default(),
            RateLimitConfig {
                per_minute: 2,
                per_hour: 2,
                per_day: 2,
                lockout: Duration::from_secs(60),
            },
        );
        let mut tokens = Vec::new();
        for _ in 0..6 {
            let issued = f.service.issue("user-1", &RequestContext::default()).await.unwrap();
            tokens.push(issued.token);
        }

        let mut rotated = 0;
        let mut limited = 0;
        for (i, token) in tokens.iter().enumerate() {
            let ctx = RequestContext::from_source(format!("10.0.0.{i}"));
            match f.service.rotate(token, &ctx).await {
                Ok(_) => rotated += 1,
                Err(AuthError::RateLimited { .. }) => limited += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(rotated, 2);
        assert_eq!(limited, 4);

        // Another user is not affected.
        let other = f.service.issue("user-2", &RequestContext::default()).await.unwrap();
        f.service
            .rotate(&other.token, &RequestContext::from_source("10.0.1.1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoke_by_jti_and_family() {
        let f = fixture();
        let ctx = RequestContext::default();
        let a = f.service.issue("user-1", &ctx).await.unwrap();
        let b = f.service.issue("user-1", &ctx).await.unwrap();

        assert!(f
            .service
            .revoke(RevokeTarget::Token(a.refresh.jti.clone()), "logout")
            .await
            .unwrap());
        assert!(!f.service.is_active(&a.refresh.jti).await.unwrap());
        // Independent session of the same user is untouched.
        assert!(f.service.is_active(&b.refresh.jti).await.unwrap());

        let result = f.service.rotate(&a.token, &ctx).await;
        assert!(matches!(result, Err(AuthError::TokenRevoked)));

        let family = RevokeTarget::Family(b.refresh.family_id.clone());
        assert!(f.service.revoke(family.clone(), "logout").await.unwrap());
        assert!(!f.service.revoke(family, "logout").await.unwrap());
        assert!(!f
            .service
            .revoke(RevokeTarget::Token("missing".into()), "logout")
            .await
            .unwrap());

        let token = f.service.find_token(&a.refresh.jti).await.unwrap().unwrap();
        assert!(token.revoked);
    }

    #[tokio::test]
    async fn test_revoke_all_and_list_sessions() {
        let f = fixture();
        let ctx = RequestContext::default();
        for _ in 0..3 {
            f.service.issue("user-1", &ctx).await.unwrap();
        }
        f.service.issue("user-2", &ctx).await.unwrap();

        assert_eq!(f.service.list_sessions("user-1").await.unwrap().len(), 3);
        assert_eq!(f.service.revoke_all_for_user("user-1", "password_reset").await.unwrap(), 3);
        assert!(f.service.list_sessions("user-1").await.unwrap().is_empty());
        assert_eq!(f.service.list_sessions("user-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_all_drops_user_scoped_cache_entries() {
        let store = Arc::new(MemoryStore::new());
        let (service, cache) =
            build_with_cache(TokenConfig::default(), RateLimitConfig::default(), store);
        let ctx = RequestContext::default();
        service.issue("user-1", &ctx).await.unwrap();
        service.issue("user-1", &ctx).await.unwrap();
        assert_eq!(service.list_sessions("user-1").await.unwrap().len(), 2);
        assert!(cache.entry("user:user-1:families").is_some());

        let ttl = Duration::from_secs(60);
        cache.set("user:user-1:profile", b"p".to_vec(), ttl).await;
        cache.set("user:user-10:profile", b"q".to_vec(), ttl).await;

        assert_eq!(service.revoke_all_for_user("user-1", "password_reset").await.unwrap(), 2);
        assert!(cache.entry("user:user-1:families").is_none());
        assert!(cache.entry("user:user-1:profile").is_none());
        assert!(cache.entry("user:user-10:profile").is_some());

        // A new login after the reset is listed without waiting for a TTL.
        service.issue("user-1", &ctx).await.unwrap();
        assert_eq!(service.list_sessions("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_family() {
        let f = fixture_with(
            TokenConfig {
                refresh_ttl: Duration::from_millis(1),
                ..TokenConfig::default()
            },
            RateLimitConfig::default(),
        );
        let ctx = RequestContext::default();
        let a = f.service.issue("user-1", &ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = f.service.rotate(&a.token, &ctx).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
        assert!(!f.service.is_active(&a.refresh.jti).await.unwrap());
        let family = f.store.get("token_family", &a.refresh.family_id).await.unwrap().unwrap();
        assert_eq!(family.value["state"], "expired");
    }

    #[tokio::test]
    async fn test_rate_limited_before_lookup() {
        let f = fixture_with(
            TokenConfig::default(),
            RateLimitConfig {
                per_minute: 2,
                per_hour: 2,
                per_day: 2,
                lockout: Duration::from_secs(60),
            },
        );
        let ctx = RequestContext::from_source("203.0.113.9");
        for _ in 0..2 {
            let result = f.service.rotate("bogus", &ctx).await;
            assert!(matches!(result, Err(AuthError::InvalidToken { .. })));
        }
        // A lookup would now fail with a storage error.
        f.store.set_available(false);
        let result = f.service.rotate("bogus", &ctx).await;
        assert!(matches!(result, Err(AuthError::RateLimited { .. })));
        assert_eq!(f.service.stats().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_login_issues_pair_and_publishes_events() {
        let f = fixture();
        let authority = LocalIdentityAuthority::new();
        authority.add_user("alice", "user-1", "pw").unwrap();
        let Ok(service) = Arc::try_unwrap(f.service) else {
            panic!("service is shared");
        };
        let service = service.with_identity(Arc::new(authority));
        let mut rx = f.events.subscribe();

        let pair = service
            .login(&Credential::new("alice", "pw"), &RequestContext::from_source("ip"))
            .await
            .unwrap();
        assert_eq!(pair.token_type, "Bearer");
        let claims = service.access_tokens().verify(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.sid, pair.family_id);
        assert!(service.is_active(&pair.refresh_jti).await.unwrap());

        let refreshed = service
            .refresh(&pair.refresh_token, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(refreshed.family_id, pair.family_id);
        assert_eq!(refreshed.refresh_expires_at, pair.refresh_expires_at);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type);
        }
        assert_eq!(
            kinds,
            vec![
                AuthEventType::SessionIssued,
                AuthEventType::LoginSucceeded,
                AuthEventType::TokenRotated,
            ]
        );

        let denied = service
            .login(&Credential::new("alice", "wrong"), &RequestContext::default())
            .await;
        assert!(matches!(denied, Err(AuthError::InvalidCredential)));
        assert_eq!(rx.try_recv().unwrap().event_type, AuthEventType::LoginFailed);
    }
}
