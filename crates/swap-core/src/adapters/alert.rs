//! Alert sinks: webhook POST, log-only, and an in-memory recorder.

use crate::domain::SwapError;
use crate::ports::{Alert, AlertSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// POSTs each alert as JSON to a webhook.
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    /// Sink posting to `url` with a bounded timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SwapError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SwapError::Alert(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), SwapError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| SwapError::Alert(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SwapError::Alert(format!("webhook returned {}", response.status())));
        }
        debug!("[alert] delivered alert for {}", alert.htlc_id);
        Ok(())
    }
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), SwapError> {
        warn!(
            htlc_id = %alert.htlc_id,
            status = %alert.status,
            timelock = alert.timelock,
            "[alert] {}",
            alert.message
        );
        Ok(())
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), SwapError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}
