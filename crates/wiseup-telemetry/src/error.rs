//! Telemetry errors.

use wiseup_core::FanoutError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TelemetryError {
    /// No fresh snapshot could be produced within the publish interval.
    #[error("snapshot stale: not produced within {waited_ms}ms")]
    SnapshotStale { waited_ms: u64 },

    #[error("fan-out error: {0}")]
    Fanout(#[from] FanoutError),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("alert sink '{sink}' failed: {message}")]
    Sink { sink: &'static str, message: String },
}

impl From<serde_json::Error> for TelemetryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
