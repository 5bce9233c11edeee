//! Observability hub.
//!
//! Correlates a request across the cache, token and batch layers (scoped spans
//! tagged with the propagated correlation id), records structured events, and
//! turns threshold crossings into alerts delivered to the configured sinks.

mod alerts;
mod sinks;
mod span;

pub use alerts::{
    Alert, AlertExpr, AlertNotification, AlertRule, AlertSeverity, AlertStatus, AlertThresholds,
    default_rules,
};
pub use sinks::{AlertSink, ChannelAlertSink, TracingAlertSink, WebhookAlertSink};
pub use span::{ScopedSpan, SpanOutcome, current_correlation_id, with_correlation};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::Instrument;
use wiseup_core::InstanceId;

use crate::aggregator::MetricsAggregator;
use crate::names;
use crate::sample::MetricsSnapshot;

const SINK_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Logged at error level and raised as a critical alert.
    Critical,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
            EventLevel::Critical => "critical",
        }
    }
}

pub struct ObservabilityHub {
    instance_id: InstanceId,
    metrics: Arc<MetricsAggregator>,
    rules: RwLock<Vec<AlertRule>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    active: DashMap<String, Alert>,
    history: Mutex<VecDeque<Alert>>,
    history_limit: usize,
}

impl ObservabilityHub {
    pub fn new(instance_id: InstanceId, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            instance_id,
            metrics,
            rules: RwLock::new(Vec::new()),
            sinks: Vec::new(),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[must_use]
    pub fn with_rules(self, rules: Vec<AlertRule>) -> Self {
        *self.rules.write() = rules;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Start a span for one operation.
    pub fn start_span(&self, name: impl Into<Cow<'static, str>>) -> ScopedSpan {
        ScopedSpan::new(name.into(), self.instance_id.as_str(), self.metrics.clone())
    }

    /// Run `fut` inside a span and record its result as the span outcome.
    pub async fn in_span<T, E, F>(&self, name: impl Into<Cow<'static, str>>, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let span = self.start_span(name);
        let result = fut.instrument(span.span().clone()).await;
        span.record_result(&result);
        result
    }

    /// Emit a structured event tagged with the current correlation id.
    pub fn record_event(&self, level: EventLevel, message: &str, context: &[(&str, String)]) {
        let correlation_id = current_correlation_id();
        let cid = correlation_id
            .as_ref()
            .map(|c| c.as_str())
            .unwrap_or("-");
        let context_str = context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");

        match level {
            EventLevel::Debug => {
                tracing::debug!(correlation_id = %cid, context = %context_str, "{message}")
            }
            EventLevel::Info => {
                tracing::info!(correlation_id = %cid, context = %context_str, "{message}")
            }
            EventLevel::Warn => {
                tracing::warn!(correlation_id = %cid, context = %context_str, "{message}")
            }
            EventLevel::Error | EventLevel::Critical => {
                tracing::error!(correlation_id = %cid, context = %context_str, "{message}")
            }
        }
        self.metrics
            .increment(names::HUB_EVENTS_TOTAL, &[("level", level.as_str())]);

        if level == EventLevel::Critical {
            self.raise_alert(
                format!("event:{message}"),
                AlertSeverity::Critical,
                format!("{message} {context_str}").trim().to_string(),
                1.0,
                0.0,
            );
        }
    }

    /// Evaluate every rule against `snapshot`, firing newly crossed rules and
    /// resolving cleared ones. Returns the transitions.
    pub fn evaluate_rules(&self, snapshot: &MetricsSnapshot) -> Vec<AlertNotification> {
        let rules = self.rules.read().clone();
        let mut transitions = Vec::new();
        for rule in &rules {
            let Some(value) = rule.expr.evaluate(snapshot) else {
                continue;
            };
            if value > rule.threshold {
                if let Some(n) = self.fire(
                    rule.name.clone(),
                    rule.severity,
                    rule.description.clone(),
                    value,
                    rule.threshold,
                ) {
                    transitions.push(n);
                }
            } else if let Some(n) = self.resolve(&rule.name, value) {
                transitions.push(n);
            }
        }
        transitions
    }

    /// Raise an alert that is not tied to a rule (e.g. an auth anomaly).
    /// Returns `false` if an alert with this key is already active.
    pub fn raise_alert(
        &self,
        key: impl Into<String>,
        severity: AlertSeverity,
        summary: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> bool {
        self.fire(key.into(), severity, summary.into(), value, threshold)
            .is_some()
    }

    /// Resolve an active alert by key. Returns `false` if it was not active.
    pub fn resolve_alert(&self, key: &str) -> bool {
        let value = self.active.get(key).map(|a| a.value).unwrap_or_default();
        self.resolve(key, value).is_some()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.iter().map(|a| a.value().clone()).collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.fired_at.cmp(&b.fired_at)));
        alerts
    }

    /// Fired and resolved alerts, newest last.
    pub fn alert_history(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }

    fn fire(
        &self,
        key: String,
        severity: AlertSeverity,
        summary: String,
        value: f64,
        threshold: f64,
    ) -> Option<AlertNotification> {
        let alert = match self.active.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                existing.get_mut().value = value;
                return None;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let alert = Alert {
                    id: wiseup_core::generate_id(),
                    key,
                    severity,
                    summary,
                    value,
                    threshold,
                    instance_id: self.instance_id.to_string(),
                    correlation_id: current_correlation_id().map(|c| c.to_string()),
                    fired_at: OffsetDateTime::now_utc(),
                    resolved_at: None,
                };
                slot.insert(alert.clone());
                alert
            }
        };
        self.metrics.increment(
            names::ALERTS_FIRED_TOTAL,
            &[("alert", alert.key.as_str()), ("severity", alert.severity.as_str())],
        );
        self.remember(alert.clone());
        let notification = AlertNotification {
            status: AlertStatus::Firing,
            alert,
        };
        self.dispatch(notification.clone());
        Some(notification)
    }

    fn resolve(&self, key: &str, value: f64) -> Option<AlertNotification> {
        let (_, mut alert) = self.active.remove(key)?;
        alert.value = value;
        alert.resolved_at = Some(OffsetDateTime::now_utc());
        self.remember(alert.clone());
        let notification = AlertNotification {
            status: AlertStatus::Resolved,
            alert,
        };
        self.dispatch(notification.clone());
        Some(notification)
    }

    fn remember(&self, alert: Alert) {
        let mut history = self.history.lock();
        history.push_back(alert);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn dispatch(&self, notification: AlertNotification) {
        if self.sinks.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(alert = %notification.alert.key, "no runtime, alert not delivered");
            return;
        };
        let notification = Arc::new(notification);
        for sink in &self.sinks {
            let sink = sink.clone();
            let notification = notification.clone();
            runtime.spawn(async move {
                match tokio::time::timeout(SINK_DELIVERY_TIMEOUT, sink.deliver(&notification)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(sink = sink.name(), error = %e, "alert delivery failed")
                    }
                    Err(_) => tracing::warn!(sink = sink.name(), "alert delivery timed out"),
                }
            });
        }
    }
}

impl std::fmt::Debug for ObservabilityHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityHub")
            .field("instance_id", &self.instance_id)
            .field("sinks", &self.sinks.len())
            .field("active_alerts", &self.active.len())
            .finish()
    }
}
