//! Refresh tokens and token families.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Public view of one refresh token. The opaque secret the client holds is
/// never stored; lookups go through its SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub jti: String,
    pub user_id: String,
    pub family_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub rotated_from: Option<String>,
    pub revoked: bool,
}

/// A freshly minted refresh token together with the secret handed to the
/// client. The secret is only available here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub refresh: RefreshToken,
    pub expires_at: OffsetDateTime,
}

/// Stored index row for one token, keyed by its hash and by its jti.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub jti: String,
    pub user_id: String,
    pub family_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub rotated_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyState {
    Active,
    Revoked,
    Expired,
}

/// State of one jti within its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Active,
    Rotated,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub jti: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Persisted rotation chain of one login session. At most one jti is
/// active; any other jti of the family is rotated away or revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFamily {
    pub family_id: String,
    pub user_id: String,
    pub active_jti: Option<String>,
    pub active_jti_hash: Option<String>,
    pub chain: Vec<ChainLink>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub state: FamilyState,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub revoked_at: Option<OffsetDateTime>,
    pub revocation_reason: Option<String>,
    /// Store row version the record was read at. Not part of the stored value.
    #[serde(skip)]
    pub version: u64,
}

impl TokenFamily {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn token_state(&self, jti: &str, now: OffsetDateTime) -> TokenState {
        match self.state {
            FamilyState::Revoked => TokenState::Revoked,
            FamilyState::Expired => TokenState::Expired,
            FamilyState::Active if self.is_expired(now) => TokenState::Expired,
            FamilyState::Active if self.active_jti.as_deref() == Some(jti) => TokenState::Active,
            FamilyState::Active => TokenState::Rotated,
        }
    }

    pub fn is_active_jti(&self, jti: &str, now: OffsetDateTime) -> bool {
        self.token_state(jti, now) == TokenState::Active
    }

    /// Move the active pointer to a new token.
    pub(crate) fn rotate_to(&mut self, jti: &str, jti_hash: &str, at: OffsetDateTime) {
        self.active_jti = Some(jti.to_string());
        self.active_jti_hash = Some(jti_hash.to_string());
        self.chain.push(ChainLink {
            jti: jti.to_string(),
            issued_at: at,
        });
    }

    pub(crate) fn revoke(&mut self, reason: &str, at: OffsetDateTime) {
        self.state = FamilyState::Revoked;
        self.active_jti = None;
        self.active_jti_hash = None;
        self.revoked_at = Some(at);
        self.revocation_reason = Some(reason.to_string());
    }

    pub(crate) fn expire(&mut self) {
        self.state = FamilyState::Expired;
        self.active_jti = None;
        self.active_jti_hash = None;
    }

    pub fn rotations(&self) -> usize {
        self.chain.len().saturating_sub(1)
    }
}

/// Active login session as listed for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub family_id: String,
    pub active_jti: Option<String>,
    pub state: FamilyState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub rotations: usize,
}

impl From<&TokenFamily> for SessionInfo {
    fn from(family: &TokenFamily) -> Self {
        Self {
            family_id: family.family_id.clone(),
            active_jti: family.active_jti.clone(),
            state: family.state,
            created_at: family.created_at,
            expires_at: family.expires_at,
            rotations: family.rotations(),
        }
    }
}

/// Hash a token secret with SHA-256 for storage and lookup.
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// 256-bit random secret, base64url encoded.
pub fn generate_token() -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
