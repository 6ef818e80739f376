//! Arrival notification delivery.

use async_trait::async_trait;
use geofence_monitor_types::{ArrivalNotification, NotificationPayload};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one arrival. The monitor logs failures and does not retry.
    async fn notify_arrival(&self, arrival: &ArrivalNotification) -> Result<(), String>;
}

/// Writes notifications to the log. Used when no callback URL is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_arrival(&self, arrival: &ArrivalNotification) -> Result<(), String> {
        let payload = NotificationPayload::from(arrival);
        log::info!(
            "[GEOFENCE] Notification {}: {} | {}",
            payload.id,
            payload.title,
            payload.body
        );
        Ok(())
    }
}

/// POSTs the notification payload as JSON to a callback URL
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_arrival(&self, arrival: &ArrivalNotification) -> Result<(), String> {
        let payload = NotificationPayload::from(arrival);
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("Callback request failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("Callback returned {}", resp.status()));
        }
        Ok(())
    }
}
