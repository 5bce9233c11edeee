//! Row and batch types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Canonical `table/key` form used for partitioning and logging.
pub fn row_key(table: &str, key: &str) -> String {
    format!("{table}/{key}")
}

/// A row as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub table: String,
    pub key: String,
    pub value: Value,
    /// Starts at 1 and increases by one on every write to the row.
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl StoredRow {
    /// Integer view of a counter row; non-numeric values read as 0.
    pub fn as_counter(&self) -> i64 {
        self.value.as_i64().unwrap_or_default()
    }
}

/// One mutation of a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowOperation {
    /// Create the row; fails if it already exists.
    Insert { value: Value },
    /// Create or replace the row.
    Upsert { value: Value },
    /// Remove the row if present.
    Delete,
    /// Add `delta` to an integer row, treating a missing row as 0.
    Increment { delta: i64 },
}

impl RowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOperation::Insert { .. } => "insert",
            RowOperation::Upsert { .. } => "upsert",
            RowOperation::Delete => "delete",
            RowOperation::Increment { .. } => "increment",
        }
    }
}

/// Ordered operations against one row, applied atomically and at most once per
/// `batch_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: String,
    pub table: String,
    pub key: String,
    pub operations: Vec<RowOperation>,
}

/// Result of [`crate::AuthoritativeStore::apply_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Applied; the row now has this version (0 when the batch deleted it).
    Applied { version: u64 },
    /// The batch id was applied before; nothing changed.
    Duplicate,
}
