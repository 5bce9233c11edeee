//! Metric sample types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Sorted label set. Sorting makes `{a,b}` and `{b,a}` the same series.
pub type Labels = BTreeMap<String, String>;

/// Build a label set from `(name, value)` pairs.
pub fn labels<K, V, I>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Distribution of observations in the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// One series as read by a snapshot.
///
/// `value` is the lifetime total for counters (non-decreasing until restart),
/// the current value for gauges and the rolling-window mean for histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Set on the first snapshot that carries this counter in the current
    /// process lifetime; consumers treat a drop in `value` there as a restart.
    #[serde(default)]
    pub reset: bool,
    /// Counter increase over the rolling window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramStats>,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Consistent point-in-time read of every series in one aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Random per process; changes on restart.
    pub process_epoch: String,
    /// Aggregation cycle this snapshot closed.
    pub cycle: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub samples: Vec<MetricSample>,
}

impl MetricsSnapshot {
    /// Samples with the given name, any labels.
    pub fn series<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricSample> + 'a {
        self.samples.iter().filter(move |s| s.name == name)
    }

    /// Sum of `value` across all label sets of `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.series(name).map(|s| s.value).sum()
    }

    /// Sum of the rolling-window increase across all label sets of `name`.
    pub fn window_total(&self, name: &str) -> f64 {
        self.series(name).filter_map(|s| s.window_delta).sum()
    }
}
