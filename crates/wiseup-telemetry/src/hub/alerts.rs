//! Alert rules and alert records.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::names;
use crate::sample::{Labels, MetricSample, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Quantity an alert rule watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertExpr {
    /// Rolling-window increase of a counter, summed over matching label sets.
    WindowIncrease {
        metric: String,
        #[serde(default)]
        labels: Labels,
    },
    /// Window increase of `numerator` divided by that of `denominator`.
    /// Not evaluated until the denominator reaches `min_denominator`.
    WindowRatio {
        numerator: String,
        denominator: String,
        min_denominator: f64,
    },
    /// Highest current value among the gauge's label sets.
    Gauge { metric: String },
    /// Highest rolling-window p95 among the histogram's label sets.
    HistogramP95 { metric: String },
}

fn matches_labels(sample: &MetricSample, labels: &Labels) -> bool {
    labels
        .iter()
        .all(|(k, v)| sample.labels.get(k).is_some_and(|actual| actual == v))
}

impl AlertExpr {
    /// Current value, or `None` if there is not enough data yet.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        match self {
            AlertExpr::WindowIncrease { metric, labels } => Some(
                snapshot
                    .series(metric)
                    .filter(|s| matches_labels(s, labels))
                    .filter_map(|s| s.window_delta)
                    .sum(),
            ),
            AlertExpr::WindowRatio {
                numerator,
                denominator,
                min_denominator,
            } => {
                let den = snapshot.window_total(denominator);
                if den <= 0.0 || den < *min_denominator {
                    return None;
                }
                Some(snapshot.window_total(numerator) / den)
            }
            AlertExpr::Gauge { metric } => snapshot
                .series(metric)
                .map(|s| s.value)
                .reduce(f64::max),
            AlertExpr::HistogramP95 { metric } => snapshot
                .series(metric)
                .filter_map(|s| s.histogram)
                .filter(|h| h.count > 0)
                .map(|h| h.p95)
                .reduce(f64::max),
        }
    }
}

/// Fires while the watched value is strictly above `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    pub severity: AlertSeverity,
    pub expr: AlertExpr,
    pub threshold: f64,
}

/// Thresholds for the built-in rule set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Cache misses / lookups over the window.
    pub cache_miss_ratio: f64,
    /// Failed rotations / rotation attempts over the window.
    pub rotation_error_ratio: f64,
    /// p95 of rotation latency in milliseconds.
    pub rotation_p95_ms: f64,
    /// Failed auth attempts in the window.
    pub auth_failures: f64,
    /// Ratios are not evaluated below this many denominator events.
    pub min_samples: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cache_miss_ratio: 0.2,
            rotation_error_ratio: 0.05,
            rotation_p95_ms: 2_000.0,
            auth_failures: 10.0,
            min_samples: 20.0,
        }
    }
}

/// Built-in rules: cache miss rate, rotation error spikes, rotation latency,
/// auth failure bursts, dead letters and dashboard staleness.
pub fn default_rules(t: &AlertThresholds) -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "cache_miss_rate".into(),
            description: "Cache miss rate above threshold".into(),
            severity: AlertSeverity::Warning,
            expr: AlertExpr::WindowRatio {
                numerator: names::CACHE_MISSES_TOTAL.into(),
                denominator: names::CACHE_LOOKUPS_TOTAL.into(),
                min_denominator: t.min_samples,
            },
            threshold: t.cache_miss_ratio,
        },
        AlertRule {
            name: "rotation_error_rate".into(),
            description: "Token rotation error rate above threshold".into(),
            severity: AlertSeverity::Critical,
            expr: AlertExpr::WindowRatio {
                numerator: names::TOKEN_ROTATION_FAILURES_TOTAL.into(),
                denominator: names::TOKEN_ROTATION_ATTEMPTS_TOTAL.into(),
                min_denominator: t.min_samples,
            },
            threshold: t.rotation_error_ratio,
        },
        AlertRule {
            name: "rotation_latency".into(),
            description: "Token rotation p95 latency above threshold".into(),
            severity: AlertSeverity::Warning,
            expr: AlertExpr::HistogramP95 {
                metric: names::TOKEN_ROTATION_DURATION_MS.into(),
            },
            threshold: t.rotation_p95_ms,
        },
        AlertRule {
            name: "auth_failure_burst".into(),
            description: "Failed authentication attempts above threshold".into(),
            severity: AlertSeverity::Warning,
            expr: AlertExpr::WindowIncrease {
                metric: names::AUTH_ATTEMPTS_TOTAL.into(),
                labels: [("outcome".to_string(), "failure".to_string())]
                    .into_iter()
                    .collect(),
            },
            threshold: t.auth_failures,
        },
        AlertRule {
            name: "batch_dead_letters".into(),
            description: "Batch writer routed mutations to the dead-letter record".into(),
            severity: AlertSeverity::Critical,
            expr: AlertExpr::WindowIncrease {
                metric: names::BATCH_DEAD_LETTERS_TOTAL.into(),
                labels: Labels::new(),
            },
            threshold: 0.0,
        },
        AlertRule {
            name: "dashboard_stale".into(),
            description: "Dashboard broadcast fell back to a stale snapshot".into(),
            severity: AlertSeverity::Info,
            expr: AlertExpr::WindowIncrease {
                metric: names::DASHBOARD_STALE_SNAPSHOTS_TOTAL.into(),
                labels: Labels::new(),
            },
            threshold: 0.0,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Rule name or anomaly key; one active alert per key.
    pub key: String,
    pub severity: AlertSeverity,
    pub summary: String,
    pub value: f64,
    pub threshold: f64,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub fired_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// What alert sinks receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub status: AlertStatus,
    pub alert: Alert,
}
