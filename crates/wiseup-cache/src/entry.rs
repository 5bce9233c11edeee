use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Tier a cached value was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierOrigin {
    /// Written by this process.
    Local,
    /// Promoted from the shared distributed tier.
    Distributed,
    /// Loaded from the authoritative store on a miss.
    Authoritative,
}

impl TierOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierOrigin::Local => "local",
            TierOrigin::Distributed => "distributed",
            TierOrigin::Authoritative => "authoritative",
        }
    }
}

/// A value held by the process-local tier.
///
/// The value is behind an `Arc` so hits hand out a cheap clone.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Vec<u8>>,
    pub tier_origin: TierOrigin,
    pub expires_at: Instant,
    /// Increases with every write to the local tier.
    pub version: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Expired, but still within `grace` of its expiry.
    pub fn is_within_grace(&self, now: Instant, grace: Duration) -> bool {
        now < self.expires_at + grace
    }
}
