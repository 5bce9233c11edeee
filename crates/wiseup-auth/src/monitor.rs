//! Auth Monitor.
//!
//! Turns authentication outcomes into health signals: failure rates per
//! user, per source and fleet-wide, and anomaly flags when a failure rate
//! crosses the configured threshold. Anomalies are raised as alerts on the
//! observability hub and resolved once they have been quiet for
//! `anomaly_ttl`.
//!
//! Recording never blocks the auth path. Attempts go through a bounded
//! queue; when it is full the attempt is dropped and counted.
//!
//! Failed attempts, reuse and anomalies are also kept as security events:
//! a bounded in-memory log that operators can filter, resolve and
//! summarise into a report.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wiseup_cache::CacheTierManager;
use wiseup_core::{AuthEvent, AuthEventBus, AuthEventType, generate_id};
use wiseup_telemetry::names::*;
use wiseup_telemetry::{AlertSeverity, ObservabilityHub};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    RateLimited,
    /// Always raises a critical anomaly.
    ReuseDetected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::ReuseDetected => "reuse_detected",
        }
    }

    fn is_failure(&self) -> bool {
        !matches!(self, AttemptOutcome::Success)
    }

    fn from_event(event_type: AuthEventType) -> Option<Self> {
        match event_type {
            AuthEventType::LoginSucceeded | AuthEventType::TokenRotated => Some(Self::Success),
            AuthEventType::LoginFailed | AuthEventType::RotationFailed => Some(Self::Failure),
            AuthEventType::RateLimited => Some(Self::RateLimited),
            AuthEventType::ReuseDetected => Some(Self::ReuseDetected),
            _ => None,
        }
    }
}

/// Who made the attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptContext {
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub family_id: Option<String>,
}

impl From<&AuthEvent> for AttemptContext {
    fn from(event: &AuthEvent) -> Self {
        Self {
            user_id: event.user_id.clone(),
            source: event.source.clone(),
            family_id: event.family_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FailureRate,
    TokenReuse,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub key: String,
    pub kind: AnomalyKind,
    /// `user`, `source`, `global` or `family`.
    pub dimension: &'static str,
    pub subject: String,
    pub failure_rate: f64,
    pub attempts: u64,
    pub severity: AlertSeverity,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    #[serde(skip)]
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    FailedAttempt,
    RateLimited,
    TokenReuse,
    FailureRateAnomaly,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::FailedAttempt => "failed_attempt",
            SecurityEventKind::RateLimited => "rate_limited",
            SecurityEventKind::TokenReuse => "token_reuse",
            SecurityEventKind::FailureRateAnomaly => "failure_rate_anomaly",
        }
    }

    fn for_outcome(outcome: AttemptOutcome) -> Option<(Self, AlertSeverity)> {
        match outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::Failure => Some((Self::FailedAttempt, AlertSeverity::Info)),
            AttemptOutcome::RateLimited => Some((Self::RateLimited, AlertSeverity::Warning)),
            AttemptOutcome::ReuseDetected => Some((Self::TokenReuse, AlertSeverity::Critical)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: String,
    pub kind: SecurityEventKind,
    pub severity: AlertSeverity,
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub family_id: Option<String>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub resolved: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl SecurityEvent {
    fn subjects(&self) -> impl Iterator<Item = String> + '_ {
        self.user_id
            .iter()
            .map(|user| format!("user:{user}"))
            .chain(self.source.iter().map(|source| format!("source:{source}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectCount {
    /// `user:{id}` or `source:{address}`.
    pub subject: String,
    pub events: usize,
}

/// Summary of the security events of the last `days` days.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub days: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    pub total_events: usize,
    pub critical_events: usize,
    pub warning_events: usize,
    pub resolved_events: usize,
    pub unresolved_events: usize,
    pub by_kind: BTreeMap<&'static str, usize>,
    /// Busiest first.
    pub top_subjects: Vec<SubjectCount>,
    /// Fleet-wide, over the sliding window.
    pub failure_rate: f64,
    pub recommendations: Vec<String>,
}

const TOP_SUBJECTS: usize = 5;
const HIGH_FAILURE_RATE: f64 = 0.2;
const HEAVY_RATE_LIMITING: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorHealth {
    /// Fleet-wide failure rate over the sliding window.
    pub failure_rate: f64,
    pub attempts: u64,
    pub failures: u64,
    pub active_anomalies: Vec<Anomaly>,
    /// Attempts lost because the queue was full.
    pub dropped: u64,
}

struct Attempt {
    outcome: AttemptOutcome,
    context: AttemptContext,
}

/// Estimate over the current and previous bucket, the previous one weighted
/// by how much of it still overlaps the window.
#[derive(Debug, Clone, Copy, Default)]
struct WindowCount {
    attempts: f64,
    failures: f64,
}

impl WindowCount {
    fn failure_rate(&self) -> f64 {
        if self.attempts <= 0.0 {
            0.0
        } else {
            (self.failures / self.attempts).min(1.0)
        }
    }
}

pub struct AuthMonitor {
    config: MonitorConfig,
    cache: Arc<CacheTierManager>,
    hub: Arc<ObservabilityHub>,
    tx: mpsc::Sender<Attempt>,
    rx: Mutex<Option<mpsc::Receiver<Attempt>>>,
    anomalies: DashMap<String, Anomaly>,
    /// Oldest first.
    events: Mutex<VecDeque<SecurityEvent>>,
    dropped: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthMonitor {
    pub fn new(config: MonitorConfig, cache: Arc<CacheTierManager>, hub: Arc<ObservabilityHub>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            cache,
            hub,
            tx,
            rx: Mutex::new(Some(rx)),
            anomalies: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Fire-and-forget. Returns `false` when the attempt was dropped.
    pub fn record_attempt(&self, outcome: AttemptOutcome, context: AttemptContext) -> bool {
        match self.tx.try_send(Attempt { outcome, context }) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.hub.metrics().increment(AUTH_MONITOR_DROPPED_TOTAL, &[]);
                false
            }
        }
    }

    /// Spawn the worker that drains the queue and follows `events`.
    pub fn start(self: &Arc<Self>, events: &AuthEventBus) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("auth monitor already started");
            return;
        };
        let mut event_rx = events.subscribe();
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        let sweep_every = (self.config.anomaly_ttl / 4)
            .clamp(Duration::from_millis(100), Duration::from_secs(30));

        let handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(attempt) = rx.recv() => {
                        monitor.observe(attempt.outcome, &attempt.context).await;
                    }
                    event = event_rx.recv() => match event {
                        Ok(event) => {
                            if let Some(outcome) = AttemptOutcome::from_event(event.event_type) {
                                monitor.observe(outcome, &AttemptContext::from(&event)).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            monitor.dropped.fetch_add(missed, Ordering::Relaxed);
                            monitor
                                .hub
                                .metrics()
                                .increment_by(AUTH_MONITOR_DROPPED_TOTAL, &[], missed);
                            warn!(missed, "auth monitor lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => monitor.expire_anomalies(),
                }
            }
            debug!("auth monitor stopped");
        });
        *self.task.lock() = Some(handle);
        info!(
            window_secs = self.config.window.as_secs(),
            threshold = self.config.failure_rate_threshold,
            "auth monitor started"
        );
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Count one attempt and evaluate the affected windows.
    pub async fn observe(&self, outcome: AttemptOutcome, context: &AttemptContext) {
        self.hub
            .metrics()
            .increment(AUTH_ATTEMPTS_TOTAL, &[("outcome", outcome.as_str())]);

        if let Some((kind, severity)) = SecurityEventKind::for_outcome(outcome) {
            let message = match kind {
                SecurityEventKind::TokenReuse => "refresh token presented after rotation",
                SecurityEventKind::RateLimited => "attempt rejected by rate limiting",
                _ => "authentication attempt failed",
            };
            self.record_event(kind, severity, context, message.to_string());
        }
        if outcome == AttemptOutcome::ReuseDetected {
            self.flag_reuse(context);
        }

        let mut dimensions: Vec<(&'static str, &str)> = vec![("global", "all")];
        if let Some(user) = context.user_id.as_deref() {
            dimensions.push(("user", user));
        }
        if let Some(source) = context.source.as_deref() {
            dimensions.push(("source", source));
        }

        for (dimension, subject) in dimensions {
            let count = self.count(dimension, subject, outcome.is_failure()).await;
            self.evaluate(dimension, subject, count);
        }
    }

    /// Current failure rate and the anomalies still active.
    pub async fn get_health_snapshot(&self) -> MonitorHealth {
        self.expire_anomalies();
        let global = self.window("global", "all").await;
        let mut active_anomalies: Vec<Anomaly> =
            self.anomalies.iter().map(|a| a.value().clone()).collect();
        active_anomalies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.detected_at.cmp(&b.detected_at))
        });
        MonitorHealth {
            failure_rate: global.failure_rate(),
            attempts: global.attempts.round() as u64,
            failures: global.failures.round() as u64,
            active_anomalies,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn active_anomaly_count(&self) -> usize {
        self.anomalies.len()
    }

    /// Newest first, optionally narrowed by severity and resolution.
    pub fn get_security_events(
        &self,
        severity: Option<AlertSeverity>,
        resolved: Option<bool>,
    ) -> Vec<SecurityEvent> {
        self.prune_events();
        self.events
            .lock()
            .iter()
            .rev()
            .filter(|e| severity.is_none_or(|s| e.severity == s))
            .filter(|e| resolved.is_none_or(|r| e.resolved == r))
            .cloned()
            .collect()
    }

    /// Marks an event resolved. `false` when it is unknown or was already
    /// resolved.
    pub fn resolve_security_event(&self, id: &str) -> bool {
        let mut events = self.events.lock();
        let Some(event) = events.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if event.resolved {
            return false;
        }
        event.resolved = true;
        event.resolved_at = Some(OffsetDateTime::now_utc());
        info!(event_id = %id, kind = event.kind.as_str(), "security event resolved");
        true
    }

    /// Failed, rate limited and replayed attempts of one user over the last
    /// `within`, newest first.
    pub fn get_failed_attempts(&self, user_id: &str, within: Duration) -> Vec<SecurityEvent> {
        let since = OffsetDateTime::now_utc() - within;
        self.events
            .lock()
            .iter()
            .rev()
            .take_while(|e| e.created_at >= since)
            .filter(|e| e.kind != SecurityEventKind::FailureRateAnomaly)
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect()
    }

    pub async fn generate_security_report(&self, days: u32) -> SecurityReport {
        let since = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
        let recent: Vec<SecurityEvent> = self
            .get_security_events(None, None)
            .into_iter()
            .take_while(|e| e.created_at >= since)
            .collect();

        let count = |severity: AlertSeverity| recent.iter().filter(|e| e.severity == severity).count();
        let mut by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut by_subject: HashMap<String, usize> = HashMap::new();
        for event in &recent {
            *by_kind.entry(event.kind.as_str()).or_default() += 1;
            for subject in event.subjects() {
                *by_subject.entry(subject).or_default() += 1;
            }
        }
        let mut top_subjects: Vec<SubjectCount> = by_subject
            .into_iter()
            .map(|(subject, events)| SubjectCount { subject, events })
            .collect();
        top_subjects.sort_by(|a, b| b.events.cmp(&a.events).then(a.subject.cmp(&b.subject)));
        top_subjects.truncate(TOP_SUBJECTS);

        let resolved_events = recent.iter().filter(|e| e.resolved).count();
        let critical_events = count(AlertSeverity::Critical);
        let failure_rate = self.window("global", "all").await.failure_rate();

        let mut recommendations = Vec::new();
        if critical_events > 0 {
            recommendations.push(format!(
                "{critical_events} critical security events need attention"
            ));
        }
        if failure_rate >= HIGH_FAILURE_RATE {
            recommendations.push(format!(
                "authentication failure rate is {:.0}%, review the login flow",
                failure_rate * 100.0
            ));
        }
        if by_kind.get(SecurityEventKind::RateLimited.as_str()).copied().unwrap_or(0)
            > HEAVY_RATE_LIMITING
        {
            recommendations.push("heavy rate limiting, review the configured limits".to_string());
        }

        SecurityReport {
            days,
            since,
            total_events: recent.len(),
            critical_events,
            warning_events: count(AlertSeverity::Warning),
            resolved_events,
            unresolved_events: recent.len() - resolved_events,
            by_kind,
            top_subjects,
            failure_rate,
            recommendations,
        }
    }

    fn record_event(
        &self,
        kind: SecurityEventKind,
        severity: AlertSeverity,
        context: &AttemptContext,
        message: String,
    ) {
        let event = SecurityEvent {
            id: generate_id(),
            kind,
            severity,
            user_id: context.user_id.clone(),
            source: context.source.clone(),
            family_id: context.family_id.clone(),
            message,
            created_at: OffsetDateTime::now_utc(),
            resolved: false,
            resolved_at: None,
        };
        debug!(event_id = %event.id, kind = kind.as_str(), "security event recorded");
        let capacity = self.config.security_event_capacity.max(1);
        let mut events = self.events.lock();
        while events.len() >= capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn prune_events(&self) {
        let cutoff = OffsetDateTime::now_utc() - self.config.security_event_retention;
        let mut events = self.events.lock();
        while events.front().is_some_and(|e| e.created_at < cutoff) {
            events.pop_front();
        }
    }

    fn bucket(&self) -> (i64, f64) {
        let span = self.config.window.as_secs().max(1) as i64;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let idx = now / span;
        let into_bucket = (now - idx * span) as f64 / span as f64;
        (idx, into_bucket)
    }

    fn counter_key(dimension: &str, subject: &str, kind: &str, idx: i64) -> String {
        format!("mon:{dimension}:{subject}:{kind}:{idx}")
    }

    async fn count(&self, dimension: &str, subject: &str, failed: bool) -> WindowCount {
        let (idx, _) = self.bucket();
        let ttl = self.config.window * 2;
        let mut kinds = vec!["a"];
        if failed {
            kinds.push("f");
        }
        for kind in kinds {
            let key = Self::counter_key(dimension, subject, kind, idx);
            if let Err(e) = self.cache.increment(&key, 1, ttl).await {
                warn!(dimension, error = %e, "auth monitor counter unavailable");
            }
        }
        self.window(dimension, subject).await
    }

    async fn window(&self, dimension: &str, subject: &str) -> WindowCount {
        let (idx, into_bucket) = self.bucket();
        let prev_weight = 1.0 - into_bucket;
        let read = |kind: &'static str, idx: i64| {
            let key = Self::counter_key(dimension, subject, kind, idx);
            async move { self.cache.get_counter(&key).await as f64 }
        };
        WindowCount {
            attempts: read("a", idx).await + read("a", idx - 1).await * prev_weight,
            failures: read("f", idx).await + read("f", idx - 1).await * prev_weight,
        }
    }

    fn evaluate(&self, dimension: &'static str, subject: &str, count: WindowCount) {
        let key = format!("auth_anomaly:{dimension}:{subject}");
        let rate = count.failure_rate();
        let breached = count.attempts >= f64::from(self.config.min_attempts)
            && rate >= self.config.failure_rate_threshold;
        if !breached {
            return;
        }

        if let Some(mut existing) = self.anomalies.get_mut(&key) {
            existing.failure_rate = rate;
            existing.attempts = count.attempts.round() as u64;
            existing.expires_at = Some(Instant::now() + self.config.anomaly_ttl);
            return;
        }

        let context = AttemptContext {
            user_id: (dimension == "user").then(|| subject.to_string()),
            source: (dimension == "source").then(|| subject.to_string()),
            family_id: None,
        };
        self.record_event(
            SecurityEventKind::FailureRateAnomaly,
            AlertSeverity::Warning,
            &context,
            format!("failure rate {:.0}% for {dimension} {subject}", rate * 100.0),
        );

        let anomaly = Anomaly {
            key: key.clone(),
            kind: AnomalyKind::FailureRate,
            dimension,
            subject: subject.to_string(),
            failure_rate: rate,
            attempts: count.attempts.round() as u64,
            severity: AlertSeverity::Warning,
            detected_at: OffsetDateTime::now_utc(),
            expires_at: Some(Instant::now() + self.config.anomaly_ttl),
        };
        self.raise(anomaly, format!(
            "auth failure rate {:.0}% for {dimension} {subject} over {} attempts",
            rate * 100.0,
            count.attempts.round()
        ));
    }

    fn flag_reuse(&self, context: &AttemptContext) {
        let subject = context
            .family_id
            .clone()
            .or_else(|| context.user_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let key = format!("auth_anomaly:reuse:{subject}");
        if let Some(mut existing) = self.anomalies.get_mut(&key) {
            existing.expires_at = Some(Instant::now() + self.config.anomaly_ttl);
            return;
        }
        let anomaly = Anomaly {
            key,
            kind: AnomalyKind::TokenReuse,
            dimension: "family",
            subject: subject.clone(),
            failure_rate: 1.0,
            attempts: 1,
            severity: AlertSeverity::Critical,
            detected_at: OffsetDateTime::now_utc(),
            expires_at: Some(Instant::now() + self.config.anomaly_ttl),
        };
        let user = context.user_id.as_deref().unwrap_or("unknown");
        self.raise(
            anomaly,
            format!("refresh token reuse in family {subject} (user {user})"),
        );
    }

    fn raise(&self, anomaly: Anomaly, summary: String) {
        let key = anomaly.key.clone();
        let severity = anomaly.severity;
        let dimension = anomaly.dimension;
        let rate = anomaly.failure_rate;
        self.anomalies.insert(key.clone(), anomaly);

        self.hub.raise_alert(
            key.clone(),
            severity,
            summary.clone(),
            rate,
            self.config.failure_rate_threshold,
        );
        self.hub
            .metrics()
            .increment(AUTH_ANOMALIES_TOTAL, &[("dimension", dimension)]);
        self.update_gauge();
        warn!(anomaly = %key, severity = severity.as_str(), "{summary}");
    }

    fn expire_anomalies(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .anomalies
            .iter()
            .filter(|a| a.expires_at.is_some_and(|at| at <= now))
            .map(|a| a.key().clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for key in expired {
            self.anomalies.remove(&key);
            self.hub.resolve_alert(&key);
            debug!(anomaly = %key, "auth anomaly cleared");
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        self.hub
            .metrics()
            .set_gauge(AUTH_ACTIVE_ANOMALIES, self.anomalies.len() as f64, &[]);
    }
}

impl Drop for AuthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
