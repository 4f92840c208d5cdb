//! Alert payload model and the chat-webhook sink.
//!
//! Alerts are rendered as a single Discord-style embed and posted with a
//! bounded timeout. Only the elected leader posts; everyone else drops the
//! alert silently so replicas never double-send.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::context::AppContext;

const RED: u32 = 16_711_680;
const GREEN: u32 = 65_280;
const RED_CIRCLE: &str = "🔴";
const GREEN_CIRCLE: &str = "🟢";
const FOOTER_ICON_URL: &str = "https://avatars.githubusercontent.com/u/221393700";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A single labeled field in an alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl AlertField {
    pub fn inline(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: true,
        }
    }

    pub fn block(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: false,
        }
    }
}

/// A structured alert before rendering.
#[derive(Debug, Clone, Default)]
pub struct Alert {
    pub title: String,
    pub description: String,
    pub fields: Vec<AlertField>,
    pub logs: Option<String>,
}

impl Alert {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
            logs: None,
        }
    }

    #[must_use]
    pub fn field(mut self, field: AlertField) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = Some(logs.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Serialize)]
struct EmbedPayload {
    embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<AlertField>,
    timestamp: String,
    footer: EmbedFooter,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: String,
    icon_url: String,
}

/// Posts rendered alerts to the configured webhook endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl Default for WebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn post(&self, webhook_url: &str, alert: Alert) -> Result<(), SinkError> {
        let payload = build_payload(alert, chrono::Utc::now().to_rfc3339());

        let response = self
            .client
            .post(webhook_url)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "webhook message sent");
            Ok(())
        } else {
            Err(SinkError::Status(status))
        }
    }
}

/// Success is signalled by a green running/completed state or an in-sync
/// status field; everything else renders red.
fn is_success(fields: &[AlertField]) -> bool {
    fields.iter().any(|f| {
        (f.name == "State" && (f.value == "Running" || f.value == "Completed"))
            || (f.name == "Status" && f.value == "✅ In Sync")
    })
}

fn build_payload(alert: Alert, timestamp: String) -> EmbedPayload {
    let (color, emoji) = if is_success(&alert.fields) {
        (GREEN, GREEN_CIRCLE)
    } else {
        (RED, RED_CIRCLE)
    };

    let mut fields = alert.fields;
    if let Some(logs) = alert.logs {
        fields.push(AlertField::block("Container Logs", logs));
    }

    EmbedPayload {
        embeds: vec![Embed {
            title: format!("{emoji} {}", alert.title),
            description: alert.description,
            color,
            fields,
            timestamp,
            footer: EmbedFooter {
                text: format!("sun v{}", env!("CARGO_PKG_VERSION")),
                icon_url: FOOTER_ICON_URL.to_string(),
            },
        }],
    }
}

impl AppContext {
    /// Send an alert through the webhook sink. Short-circuits when this
    /// replica is not the leader. Delivery failures are logged and
    /// swallowed; the next event retries naturally.
    pub async fn send_alert(&self, alert: Alert) {
        if !self.is_leader() {
            debug!(title = %alert.title, "not the leader, skipping webhook message");
            return;
        }

        let webhook_url = { self.config.read().await.webhook_url.clone() };
        if webhook_url.is_empty() {
            debug!(title = %alert.title, "no webhook URL configured, dropping alert");
            return;
        }

        debug!(title = %alert.title, "sending webhook message");
        if let Err(err) = self.sink.post(&webhook_url, alert).await {
            error!(error = %err, "webhook request failed");
        }
    }
}
