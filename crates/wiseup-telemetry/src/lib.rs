//! # wiseup-telemetry
//!
//! Metrics, tracing correlation and live dashboards for the session core.
//!
//! - [`MetricsAggregator`]: counters, gauges and histograms in rolling
//!   windows, with consistent snapshots and a Prometheus text mirror
//! - [`ObservabilityHub`]: scoped spans, correlation ids, structured events,
//!   alert rules and alert sinks
//! - [`DashboardBroadcaster`]: pushes the merged fleet view to connected
//!   observers, coordinating with peer instances over the fan-out channel

pub mod aggregator;
pub mod dashboard;
mod error;
pub mod hub;
pub mod names;
mod sample;
mod window;

pub use aggregator::{AggregatorConfig, MetricsAggregator};
pub use dashboard::{
    DashboardBroadcaster, DashboardConfig, DashboardMessage, DashboardSnapshot, FleetView,
    ObserverMessage, SubscriptionHandle,
};
pub use error::TelemetryError;
pub use hub::{
    AlertSeverity, EventLevel, ObservabilityHub, ScopedSpan, current_correlation_id,
    with_correlation,
};
pub use sample::{HistogramStats, Labels, MetricKind, MetricSample, MetricsSnapshot, labels};
