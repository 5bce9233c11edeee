//! Identity authority and access-token minting.
//!
//! Credential verification belongs to the identity authority; the session
//! core only asks it for a user id. [`LocalIdentityAuthority`] is an in-process
//! authority with Argon2id password hashes for single-node deployments and
//! tests.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

/// Username and password as presented at login.
#[derive(Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Validates credentials and maps them to a user id.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// # Errors
    ///
    /// `AuthError::InvalidCredential` when the credential is rejected.
    async fn validate_credential(&self, credential: &Credential) -> AuthResult<String>;

    fn name(&self) -> &'static str;
}

pub type DynIdentityAuthority = Arc<dyn IdentityAuthority>;

struct LocalUser {
    user_id: String,
    password_hash: String,
}

/// In-process identity authority keyed by username.
#[derive(Default)]
pub struct LocalIdentityAuthority {
    users: DashMap<String, Arc<LocalUser>>,
}

impl LocalIdentityAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a user.
    pub fn add_user(
        &self,
        username: impl Into<String>,
        user_id: impl Into<String>,
        password: &str,
    ) -> AuthResult<()> {
        let password_hash = hash_password(password)?;
        self.users.insert(
            username.into(),
            Arc::new(LocalUser {
                user_id: user_id.into(),
                password_hash,
            }),
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl IdentityAuthority for LocalIdentityAuthority {
    async fn validate_credential(&self, credential: &Credential) -> AuthResult<String> {
        let user = self
            .users
            .get(&credential.username)
            .map(|u| Arc::clone(u.value()))
            .ok_or(AuthError::InvalidCredential)?;

        // Argon2 verification is CPU bound.
        let password = credential.password.clone();
        let hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::internal(format!("password verification task: {e}")))??;

        if valid {
            Ok(user.user_id.clone())
        } else {
            Err(AuthError::InvalidCredential)
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Hash a password for storage using Argon2id with a random salt.
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::internal(format!("password hashing failed: {e}")))
}

/// Verify a password against a PHC-formatted Argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AuthError::internal(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Claims of the short-lived access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    /// Token family (session) the access token belongs to.
    pub sid: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and verifies HS256 access tokens.
pub struct AccessTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: Duration,
}

impl AccessTokenIssuer {
    pub fn new(secret: &str, issuer: impl Into<String>, ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint an access token for `user_id` within session `family_id`.
    pub fn issue(&self, user_id: &str, family_id: &str) -> AuthResult<(String, AccessClaims)> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            sid: family_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::internal(format!("failed to encode access token: {e}")))?;
        Ok((token, claims))
    }

    /// Decode and validate signature, issuer and expiry.
    pub fn verify(&self, token: &str) -> AuthResult<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;
        Ok(decode::<AccessClaims>(token, &self.decoding_key, &validation)?.claims)
    }
}
