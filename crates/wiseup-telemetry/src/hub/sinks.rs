//! Alert sinks.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::alerts::{AlertNotification, AlertSeverity, AlertStatus};
use crate::error::TelemetryError;

/// External channel that receives threshold-crossing events. Delivery is
/// fire-and-forget from the hub's point of view.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, notification: &AlertNotification) -> Result<(), TelemetryError>;

    fn name(&self) -> &'static str;
}

/// Writes alerts to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn deliver(&self, notification: &AlertNotification) -> Result<(), TelemetryError> {
        let alert = &notification.alert;
        match (notification.status, alert.severity) {
            (AlertStatus::Resolved, _) => tracing::info!(
                alert = %alert.key,
                value = alert.value,
                "alert resolved"
            ),
            (AlertStatus::Firing, AlertSeverity::Critical) => tracing::error!(
                alert = %alert.key,
                value = alert.value,
                threshold = alert.threshold,
                summary = %alert.summary,
                "alert firing"
            ),
            (AlertStatus::Firing, _) => tracing::warn!(
                alert = %alert.key,
                value = alert.value,
                threshold = alert.threshold,
                summary = %alert.summary,
                "alert firing"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// POSTs each notification as JSON to a webhook (paging or log aggregation).
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Sink {
                sink: "webhook",
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, notification: &AlertNotification) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| TelemetryError::Sink {
                sink: "webhook",
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(TelemetryError::Sink {
                sink: "webhook",
                message: format!("status {}", response.status()),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Forwards notifications into a bounded channel; full channel drops.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<AlertNotification>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn deliver(&self, notification: &AlertNotification) -> Result<(), TelemetryError> {
        self.tx
            .try_send(notification.clone())
            .map_err(|e| TelemetryError::Sink {
                sink: "channel",
                message: e.to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
