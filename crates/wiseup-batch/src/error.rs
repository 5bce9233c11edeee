//! Batch writer errors.

use wiseup_storage::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchError {
    /// The journal append failed, so the mutation was not acknowledged.
    #[error("journal error: {0}")]
    Journal(String),

    /// A batch exhausted its retry budget. Only ever surfaced through
    /// dead-letter records, never to the caller that enqueued it.
    #[error("flush failed for {table}/{key} after {attempts} attempts: {source}")]
    FlushFailed {
        table: String,
        key: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("batch writer is shutting down")]
    ShuttingDown,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for BatchError {
    fn from(e: std::io::Error) -> Self {
        Self::Journal(e.to_string())
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
