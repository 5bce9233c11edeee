//! Mutation, acknowledgement and dead-letter types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use wiseup_storage::{RowOperation, row_key};

/// A mutation as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub key: String,
    pub operation: RowOperation,
}

impl Mutation {
    pub fn new(table: impl Into<String>, key: impl Into<String>, operation: RowOperation) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            operation,
        }
    }

    pub fn increment(table: impl Into<String>, key: impl Into<String>, delta: i64) -> Self {
        Self::new(table, key, RowOperation::Increment { delta })
    }

    pub fn upsert(table: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self::new(table, key, RowOperation::Upsert { value })
    }

    pub fn insert(table: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self::new(table, key, RowOperation::Insert { value })
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(table, key, RowOperation::Delete)
    }
}

/// A mutation once it has been journaled.
///
/// `seq` is unique and increasing across the writer's lifetime, including
/// restarts, and fixes the apply order within a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedMutation {
    pub id: String,
    pub seq: u64,
    pub target_table: String,
    pub target_key: String,
    /// The operation with its payload (value or delta).
    pub operation: RowOperation,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl BatchedMutation {
    pub fn partition(&self) -> String {
        row_key(&self.target_table, &self.target_key)
    }
}

/// Returned once a mutation is durably journaled. It has not necessarily
/// reached the store yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub id: String,
    pub seq: u64,
    pub enqueued_at: OffsetDateTime,
}

/// A mutation that could not be applied after retries, kept for manual
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub mutation: BatchedMutation,
    pub error: String,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}
