use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreError;
use crate::types::{BatchOutcome, MutationBatch, StoredRow};

/// Durable row store.
///
/// Implementations must be thread-safe and guarantee atomicity per row. No
/// cross-row transactions are assumed by callers.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    /// Read a row. `Ok(None)` when it does not exist.
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Unconditionally write a row, returning its new version.
    async fn put(&self, table: &str, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Write a row only if its current version equals `expected_version`
    /// (`None` meaning the row must not exist yet).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::VersionConflict` when another writer got there first.
    async fn compare_and_put(
        &self,
        table: &str,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<u64, StoreError>;

    /// Delete a row. Returns whether it existed.
    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError>;

    /// Apply a batch of operations to one row atomically. A batch id that was
    /// already applied is acknowledged as [`BatchOutcome::Duplicate`].
    async fn apply_batch(&self, batch: &MutationBatch) -> Result<BatchOutcome, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub type DynStore = Arc<dyn AuthoritativeStore>;
