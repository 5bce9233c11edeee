//! Scoped spans and correlation id propagation.

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use wiseup_core::CorrelationId;

use crate::aggregator::MetricsAggregator;
use crate::names;

tokio::task_local! {
    static CORRELATION_ID: CorrelationId;
}

/// Run `fut` with `id` as the current correlation id.
pub async fn with_correlation<F: Future>(id: CorrelationId, fut: F) -> F::Output {
    CORRELATION_ID.scope(id, fut).await
}

/// Correlation id of the enclosing request, if any.
pub fn current_correlation_id() -> Option<CorrelationId> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    Ok,
    Error,
    /// Dropped without an explicit outcome: early return or cancellation.
    Dropped,
}

impl SpanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanOutcome::Ok => "ok",
            SpanOutcome::Error => "error",
            SpanOutcome::Dropped => "dropped",
        }
    }
}

/// A timed operation. Duration and outcome are recorded exactly once, when the
/// span is dropped, whichever way the enclosing operation ends.
pub struct ScopedSpan {
    name: Cow<'static, str>,
    span: tracing::Span,
    started: Instant,
    outcome: Option<SpanOutcome>,
    error: Option<String>,
    correlation_id: Option<CorrelationId>,
    metrics: Arc<MetricsAggregator>,
}

impl ScopedSpan {
    pub(crate) fn new(
        name: Cow<'static, str>,
        instance_id: &str,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        let correlation_id = current_correlation_id();
        let span = tracing::info_span!(
            "wiseup.op",
            op = %name,
            correlation_id = %correlation_id.as_ref().map(CorrelationId::as_str).unwrap_or("-"),
            instance = %instance_id,
        );
        Self {
            name,
            span,
            started: Instant::now(),
            outcome: None,
            error: None,
            correlation_id,
            metrics,
        }
    }

    /// The underlying tracing span, for `Instrument`.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn succeed(mut self) {
        self.outcome = Some(SpanOutcome::Ok);
    }

    pub fn fail(mut self, error: &dyn Display) {
        self.outcome = Some(SpanOutcome::Error);
        self.error = Some(error.to_string());
    }

    pub fn record_result<T, E: Display>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.succeed(),
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(SpanOutcome::Dropped);
        let elapsed = self.started.elapsed();
        let labels = [("span", self.name.as_ref()), ("outcome", outcome.as_str())];
        self.metrics
            .observe_duration(names::SPAN_DURATION_MS, elapsed, &labels);
        self.metrics.increment(names::SPANS_TOTAL, &labels);

        let _entered = self.span.enter();
        let duration_ms = elapsed.as_secs_f64() * 1_000.0;
        match (&self.error, outcome) {
            (Some(error), _) => {
                tracing::warn!(duration_ms, outcome = outcome.as_str(), error = %error, "span closed")
            }
            (None, SpanOutcome::Dropped) => {
                tracing::debug!(duration_ms, outcome = outcome.as_str(), "span dropped")
            }
            (None, _) => tracing::debug!(duration_ms, outcome = outcome.as_str(), "span closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_correlation_scope() {
        assert!(current_correlation_id().is_none());
        let id = CorrelationId::new("req-1");
        let seen = with_correlation(id.clone(), async { current_correlation_id() }).await;
        assert_eq!(seen, Some(id));
        assert!(current_correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_span_records_on_every_exit() {
        let metrics = Arc::new(MetricsAggregator::default());

        ScopedSpan::new("ok_op".into(), "i1", metrics.clone()).succeed();
        ScopedSpan::new("err_op".into(), "i1", metrics.clone()).fail(&"boom");
        drop(ScopedSpan::new("dropped_op".into(), "i1", metrics.clone()));

        assert_eq!(
            metrics.counter_value(names::SPANS_TOTAL, &[("span", "ok_op"), ("outcome", "ok")]),
            1
        );
        assert_eq!(
            metrics.counter_value(names::SPANS_TOTAL, &[("span", "err_op"), ("outcome", "error")]),
            1
        );
        assert_eq!(
            metrics.counter_value(
                names::SPANS_TOTAL,
                &[("span", "dropped_op"), ("outcome", "dropped")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn test_span_captures_correlation() {
        let metrics = Arc::new(MetricsAggregator::default());
        let span = with_correlation(CorrelationId::new("abc"), async {
            ScopedSpan::new("op".into(), "i1", metrics.clone())
        })
        .await;
        assert_eq!(span.correlation_id().map(|c| c.as_str()), Some("abc"));
    }
}
