//! Metrics aggregator.
//!
//! An explicit service object (no global registry) that every component gets a
//! handle to. Recording takes a shared cycle gate and a per-series lock;
//! [`MetricsAggregator::snapshot`] takes the gate exclusively, so a snapshot is
//! a consistent cut that never mixes two aggregation cycles.
//!
//! Every sample is mirrored into a process-local Prometheus recorder so the
//! pull endpoint can render text exposition without a second bookkeeping path.

use dashmap::DashMap;
use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::sample::{Labels, MetricKind, MetricSample, MetricsSnapshot};
use crate::window::{HistogramBucket, Rolling, SlotClock};

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Width of one rolling window slot.
    pub window: Duration,
    /// Number of slots kept; the rolling window spans `window * window_count`.
    pub window_count: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            window_count: 6,
        }
    }
}

enum SeriesData {
    Counter {
        total: u64,
        window: Rolling<u64>,
        emitted: bool,
    },
    Gauge {
        value: f64,
    },
    Histogram {
        window: Rolling<HistogramBucket>,
    },
}

struct Series {
    name: String,
    labels: Labels,
    kind: MetricKind,
    data: Mutex<SeriesData>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let mut key = String::with_capacity(name.len() + 16 * sorted.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.push('}');
    key
}

fn prometheus_key(name: &str, labels: &[(&str, &str)]) -> Key {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect();
    Key::from_parts(name.to_string(), labels)
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

pub struct MetricsAggregator {
    series: DashMap<String, Series>,
    cycle_gate: RwLock<u64>,
    process_epoch: String,
    clock: SlotClock,
    config: AggregatorConfig,
    prometheus: PrometheusRecorder,
    prometheus_handle: PrometheusHandle,
}

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let prometheus = PrometheusBuilder::new().build_recorder();
        let prometheus_handle = prometheus.handle();
        Self {
            series: DashMap::new(),
            cycle_gate: RwLock::new(0),
            process_epoch: uuid::Uuid::new_v4().to_string(),
            clock: SlotClock::new(config.window),
            config,
            prometheus,
            prometheus_handle,
        }
    }

    pub fn new_shared(config: AggregatorConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Random id of this process lifetime, carried by every snapshot.
    pub fn process_epoch(&self) -> &str {
        &self.process_epoch
    }

    /// Span covered by the rolling window.
    pub fn window_span(&self) -> Duration {
        self.config.window * self.config.window_count as u32
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_by(name, labels, 1);
    }

    pub fn increment_by(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        self.record(name, labels, MetricKind::Counter, |data, slot| {
            if let SeriesData::Counter { total, window, .. } = data {
                *total = total.saturating_add(delta);
                *window.current(slot) += delta;
            }
        });
        self.prometheus
            .register_counter(&prometheus_key(name, labels), &metadata())
            .increment(delta);
    }

    pub fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.record(name, labels, MetricKind::Histogram, |data, slot| {
            if let SeriesData::Histogram { window } = data {
                window.current(slot).observe(value);
            }
        });
        self.prometheus
            .register_histogram(&prometheus_key(name, labels), &metadata())
            .record(value);
    }

    /// Record a duration in milliseconds.
    pub fn observe_duration(&self, name: &str, duration: Duration, labels: &[(&str, &str)]) {
        self.observe(name, duration.as_secs_f64() * 1_000.0, labels);
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.record(name, labels, MetricKind::Gauge, |data, _| {
            if let SeriesData::Gauge { value: current } = data {
                *current = value;
            }
        });
        self.prometheus
            .register_gauge(&prometheus_key(name, labels), &metadata())
            .set(value);
    }

    fn record(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        kind: MetricKind,
        apply: impl FnOnce(&mut SeriesData, u64),
    ) {
        let _gate = self.cycle_gate.read();
        let slot = self.clock.slot();
        let key = series_key(name, labels);

        let series = match self.series.get(&key) {
            Some(series) => series,
            None => self
                .series
                .entry(key)
                .or_insert_with(|| self.new_series(name, labels, kind))
                .downgrade(),
        };
        if series.kind != kind {
            tracing::debug!(
                metric = name,
                registered = series.kind.as_str(),
                requested = kind.as_str(),
                "metric kind mismatch, sample ignored"
            );
            return;
        }
        apply(&mut series.data.lock(), slot);
    }

    fn new_series(&self, name: &str, labels: &[(&str, &str)], kind: MetricKind) -> Series {
        let data = match kind {
            MetricKind::Counter => SeriesData::Counter {
                total: 0,
                window: Rolling::new(self.config.window_count),
                emitted: false,
            },
            MetricKind::Gauge => SeriesData::Gauge { value: 0.0 },
            MetricKind::Histogram => SeriesData::Histogram {
                window: Rolling::new(self.config.window_count),
            },
        };
        Series {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            kind,
            data: Mutex::new(data),
        }
    }

    /// Consistent read of every series.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut cycle = self.cycle_gate.write();
        *cycle += 1;
        let slot = self.clock.slot();
        let now = OffsetDateTime::now_utc();

        let mut samples = Vec::with_capacity(self.series.len());
        for entry in self.series.iter() {
            let series = entry.value();
            let mut data = series.data.lock();
            let mut sample = MetricSample {
                name: series.name.clone(),
                kind: series.kind,
                value: 0.0,
                labels: series.labels.clone(),
                timestamp: now,
                reset: false,
                window_delta: None,
                histogram: None,
            };
            match &mut *data {
                SeriesData::Counter {
                    total,
                    window,
                    emitted,
                } => {
                    sample.value = *total as f64;
                    sample.window_delta = Some(window.live(slot).sum::<u64>() as f64);
                    sample.reset = !*emitted;
                    *emitted = true;
                }
                SeriesData::Gauge { value } => sample.value = *value,
                SeriesData::Histogram { window } => {
                    let mut merged = HistogramBucket::default();
                    for bucket in window.live(slot) {
                        merged.merge(bucket);
                    }
                    let stats = merged.stats();
                    sample.value = stats.mean;
                    sample.histogram = Some(stats);
                }
            }
            samples.push(sample);
        }
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));

        MetricsSnapshot {
            process_epoch: self.process_epoch.clone(),
            cycle: *cycle,
            generated_at: now,
            samples,
        }
    }

    /// Lifetime total of one counter series.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let _gate = self.cycle_gate.read();
        self.series
            .get(&series_key(name, labels))
            .and_then(|series| match &*series.data.lock() {
                SeriesData::Counter { total, .. } => Some(*total),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Lifetime total of a counter summed over every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        let _gate = self.cycle_gate.read();
        self.series
            .iter()
            .filter(|entry| entry.value().name == name)
            .filter_map(|entry| match &*entry.value().data.lock() {
                SeriesData::Counter { total, .. } => Some(*total),
                _ => None,
            })
            .sum()
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let _gate = self.cycle_gate.read();
        self.series
            .get(&series_key(name, labels))
            .and_then(|series| match &*series.data.lock() {
                SeriesData::Gauge { value } => Some(*value),
                _ => None,
            })
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render_prometheus(&self) -> String {
        self.prometheus_handle.run_upkeep();
        self.prometheus_handle.render()
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("process_epoch", &self.process_epoch)
            .field("series", &self.series.len())
            .finish()
    }
}
