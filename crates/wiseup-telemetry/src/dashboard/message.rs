//! Dashboard wire schema.
//!
//! Snapshots travel between instances as JSON on the fan-out channel; merged
//! views travel to observers as JSON text frames.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::hub::Alert;
use crate::sample::{MetricKind, MetricSample, MetricsSnapshot};

/// One instance's metrics at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub origin_instance_id: String,
    /// Changes whenever the origin process restarts.
    pub process_epoch: String,
    /// Increases by one per snapshot within a process epoch.
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub metrics: Vec<MetricSample>,
    #[serde(default)]
    pub stale: bool,
}

impl DashboardSnapshot {
    pub fn from_metrics(origin: &str, sequence: u64, snapshot: MetricsSnapshot) -> Self {
        Self {
            origin_instance_id: origin.to_string(),
            process_epoch: snapshot.process_epoch,
            sequence,
            generated_at: snapshot.generated_at,
            metrics: snapshot.samples,
            stale: false,
        }
    }
}

/// A metric summed across every origin in the merged view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetTotal {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
}

/// Latest snapshot per origin plus fleet-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetView {
    /// Instance that assembled this view.
    pub instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// Set when a fresh local snapshot could not be produced in time and this
    /// is the last known view.
    pub stale: bool,
    pub origins: Vec<DashboardSnapshot>,
    pub totals: Vec<FleetTotal>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl FleetView {
    pub fn origin(&self, instance_id: &str) -> Option<&DashboardSnapshot> {
        self.origins
            .iter()
            .find(|s| s.origin_instance_id == instance_id)
    }

    pub fn total(&self, name: &str) -> Option<f64> {
        self.totals.iter().find(|t| t.name == name).map(|t| t.value)
    }
}

/// Server to observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    Snapshot { view: FleetView },
    /// Liveness check; observers answer with [`ObserverMessage::Ack`].
    Ping { nonce: u64 },
    Close { reason: String },
}

/// Observer to server. Observers only ever acknowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    Ack {
        #[serde(default)]
        nonce: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_ack_parses_without_nonce() {
        let msg: ObserverMessage = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
        assert_eq!(msg, ObserverMessage::Ack { nonce: None });
        let msg: ObserverMessage = serde_json::from_str(r#"{"type":"ack","nonce":7}"#).unwrap();
        assert_eq!(msg, ObserverMessage::Ack { nonce: Some(7) });
    }

    #[test]
    fn test_ping_wire_format() {
        let json = serde_json::to_value(DashboardMessage::Ping { nonce: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "nonce": 3}));
    }
}
