//! Notification sinks for side-effect actions
//!
//! Email, MQTT and camera transports are deployment specific and injected by
//! the daemon. Two sinks are built in: [`WebhookSink`] posts JSON over HTTP,
//! [`LogSink`] only logs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Transport a notification is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Email,
    Mqtt,
    Webhook,
    Camera,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationKind::Email => "email",
            NotificationKind::Mqtt => "mqtt",
            NotificationKind::Webhook => "webhook",
            NotificationKind::Camera => "camera",
        };
        f.write_str(name)
    }
}

/// Payload handed to a sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub action_id: String,
    pub owner_id: String,
    /// Address, topic, URL or camera id
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    /// HTTP method for webhooks
    #[serde(skip_serializing)]
    pub method: Option<String>,
    /// The chain's value map at send time
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Delivers notifications of one or more kinds
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), SinkError>;
}

/// Logs notifications at info level
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: Notification) -> Result<(), SinkError> {
        info!(
            kind = %notification.kind,
            action_id = %notification.action_id,
            target = %notification.target,
            subject = notification.subject.as_deref().unwrap_or(""),
            body = %notification.body,
            "Notification"
        );
        Ok(())
    }
}

/// Posts notifications as JSON
///
/// Without a fixed URL the notification's `target` is used, which is what
/// webhook actions put there.
pub struct WebhookSink {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            url: None,
        }
    }

    /// Send every notification to `url`
    pub fn fixed(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new()
        }
    }
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, notification: Notification) -> Result<(), SinkError> {
        let url = self.url.as_deref().unwrap_or(&notification.target);
        let method = notification
            .method
            .as_deref()
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| SinkError(format!("invalid HTTP method {}", method)))?;

        debug!(url = %url, method = %method, "Posting webhook");
        let response = self
            .client
            .request(method, url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| SinkError(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError(format!("webhook returned {}", status)));
        }
        Ok(())
    }
}

/// Sinks by notification kind
#[derive(Default)]
pub struct NotificationSinks {
    sinks: DashMap<NotificationKind, Arc<dyn NotificationSink>>,
}

impl NotificationSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in defaults: webhooks over HTTP, everything else logged
    pub fn with_defaults() -> Self {
        let sinks = Self::new();
        let log: Arc<dyn NotificationSink> = Arc::new(LogSink);
        sinks.register(NotificationKind::Webhook, Arc::new(WebhookSink::new()));
        sinks.register(NotificationKind::Email, log.clone());
        sinks.register(NotificationKind::Mqtt, log.clone());
        sinks.register(NotificationKind::Camera, log);
        sinks
    }

    pub fn register(&self, kind: NotificationKind, sink: Arc<dyn NotificationSink>) {
        self.sinks.insert(kind, sink);
    }

    pub fn get(&self, kind: NotificationKind) -> Option<Arc<dyn NotificationSink>> {
        self.sinks.get(&kind).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_defaults_cover_every_kind() {
        let sinks = NotificationSinks::with_defaults();
        for kind in [
            NotificationKind::Email,
            NotificationKind::Mqtt,
            NotificationKind::Webhook,
            NotificationKind::Camera,
        ] {
            assert!(sinks.get(kind).is_some(), "no sink for {}", kind);
        }
    }

    #[tokio::test]
    async fn test_log_sink_accepts() {
        let notification = Notification {
            kind: NotificationKind::Email,
            action_id: "a1".into(),
            owner_id: "cond".into(),
            target: "grower@example.test".into(),
            subject: Some("Too hot".into()),
            body: "tent at 34C".into(),
            method: None,
            data: serde_json::json!({}),
        };
        assert_ok!(LogSink.send(notification).await);
    }

    #[test]
    fn test_payload_omits_method() {
        let notification = Notification {
            kind: NotificationKind::Webhook,
            action_id: "a1".into(),
            owner_id: "cond".into(),
            target: "http://localhost/hook".into(),
            subject: None,
            body: "hello".into(),
            method: Some("PUT".into()),
            data: serde_json::json!({"temperature": 31.0}),
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["kind"], "webhook");
        assert!(json.get("method").is_none());
        assert!(json.get("subject").is_none());
        assert_eq!(json["data"]["temperature"], 31.0);
    }
}
