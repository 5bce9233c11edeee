//! Cross-instance invalidation notices.

use serde::{Deserialize, Serialize};
use wiseup_core::InstanceId;

/// Published on the invalidation topic after a local invalidation. Peers drop
/// the key (or, for a prefix notice, every key under it) from their local
/// tier; the publishing instance ignores its own notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationNotice {
    pub origin: InstanceId,
    pub key: String,
    /// `key` is a prefix rather than a single key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prefix: bool,
}

impl InvalidationNotice {
    pub fn new(origin: InstanceId, key: impl Into<String>) -> Self {
        Self {
            origin,
            key: key.into(),
            prefix: false,
        }
    }

    pub fn for_prefix(origin: InstanceId, prefix: impl Into<String>) -> Self {
        Self {
            origin,
            key: prefix.into(),
            prefix: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
