//! Merge-by-origin of dashboard snapshots.
//!
//! The newest snapshot per origin wins: a higher sequence within the same
//! process epoch, or a different epoch generated no earlier than what we hold.
//! Replays, duplicates and reordering therefore leave the table unchanged, so
//! correctness does not depend on delivery order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::message::{DashboardSnapshot, FleetTotal};
use crate::sample::MetricKind;

struct PeerEntry {
    snapshot: Arc<DashboardSnapshot>,
    received_at: Instant,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    entries: HashMap<String, PeerEntry>,
}

impl PeerTable {
    /// Returns `true` if the snapshot replaced what was held for its origin.
    pub(crate) fn merge(&mut self, snapshot: DashboardSnapshot, now: Instant) -> bool {
        if let Some(existing) = self.entries.get(&snapshot.origin_instance_id) {
            let held = &existing.snapshot;
            let newer = if held.process_epoch == snapshot.process_epoch {
                snapshot.sequence > held.sequence
            } else {
                snapshot.generated_at >= held.generated_at
            };
            if !newer {
                return false;
            }
        }
        self.entries.insert(
            snapshot.origin_instance_id.clone(),
            PeerEntry {
                snapshot: Arc::new(snapshot),
                received_at: now,
            },
        );
        true
    }

    /// Drop origins not heard from within `ttl`, except `keep` (this instance).
    pub(crate) fn expire(&mut self, ttl: Duration, now: Instant, keep: &str) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(origin, entry)| {
                origin.as_str() != keep && now.duration_since(entry.received_at) > ttl
            })
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in &expired {
            self.entries.remove(origin);
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Latest snapshot per origin, ordered by origin id.
    pub(crate) fn origins(&self) -> Vec<DashboardSnapshot> {
        let mut origins: Vec<DashboardSnapshot> = self
            .entries
            .values()
            .map(|e| e.snapshot.as_ref().clone())
            .collect();
        origins.sort_by(|a, b| a.origin_instance_id.cmp(&b.origin_instance_id));
        origins
    }
}

/// Sum counters and gauges by name across origins.
pub(crate) fn fleet_totals(origins: &[DashboardSnapshot]) -> Vec<FleetTotal> {
    let mut totals: BTreeMap<(String, MetricKind), f64> = BTreeMap::new();
    for snapshot in origins {
        for sample in &snapshot.metrics {
            if sample.kind == MetricKind::Histogram {
                continue;
            }
            *totals.entry((sample.name.clone(), sample.kind)).or_default() += sample.value;
        }
    }
    totals
        .into_iter()
        .map(|((name, kind), value)| FleetTotal { name, kind, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MetricSample;
    use time::OffsetDateTime;

    fn snap(origin: &str, epoch: &str, sequence: u64, value: f64) -> DashboardSnapshot {
        DashboardSnapshot {
            origin_instance_id: origin.into(),
            process_epoch: epoch.into(),
            sequence,
            generated_at: OffsetDateTime::now_utc(),
            metrics: vec![MetricSample {
                name: "logins".into(),
                kind: MetricKind::Counter,
                value,
                labels: Default::default(),
                timestamp: OffsetDateTime::now_utc(),
                reset: false,
                window_delta: None,
                histogram: None,
            }],
            stale: false,
        }
    }

    #[test]
    fn test_merge_ignores_duplicates_and_reordering() {
        let mut table = PeerTable::default();
        let now = Instant::now();
        assert!(table.merge(snap("a", "e1", 2, 20.0), now));
        assert!(!table.merge(snap("a", "e1", 2, 20.0), now));
        assert!(!table.merge(snap("a", "e1", 1, 10.0), now));
        assert!(table.merge(snap("a", "e1", 3, 30.0), now));
        assert_eq!(table.origins()[0].sequence, 3);
    }

    #[test]
    fn test_epoch_change_replaces_after_restart() {
        let mut table = PeerTable::default();
        let now = Instant::now();
        table.merge(snap("a", "e1", 50, 500.0), now);
        assert!(table.merge(snap("a", "e2", 1, 1.0), now));
        let origins = table.origins();
        assert_eq!(origins[0].process_epoch, "e2");
        assert_eq!(origins[0].sequence, 1);
    }

    #[test]
    fn test_totals_sum_across_origins() {
        let origins = vec![snap("a", "e", 1, 3.0), snap("b", "e", 1, 4.0)];
        let totals = fleet_totals(&origins);
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].value, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_keeps_self() {
        let mut table = PeerTable::default();
        table.merge(snap("self", "e", 1, 0.0), Instant::now());
        table.merge(snap("peer", "e", 1, 0.0), Instant::now());
        tokio::time::advance(Duration::from_secs(10)).await;
        let expired = table.expire(Duration::from_secs(5), Instant::now(), "self");
        assert_eq!(expired, vec!["peer".to_string()]);
        assert_eq!(table.len(), 1);
    }
}
