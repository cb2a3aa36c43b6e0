//! Notification sinks: where a newly seen item's title/body pair is delivered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "fundwatch-notify";

pub const PUSHBULLET_PUSHES_URL: &str = "https://api.pushbullet.com/v2/pushes";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    Rejected(String),
}

/// Delivery capability handed to the dispatch engine.
///
/// Calls are not idempotent: every successful push is a user-visible notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn push(&self, title: &str, body: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Default)]
pub struct PushbulletConfig {
    pub api_key: String,
    /// Channel tag to broadcast to instead of the account's own devices.
    pub channel: Option<String>,
    pub endpoint: Option<String>,
    pub timeout: Option<Duration>,
}

/// Pushes notes through the Pushbullet REST API.
pub struct PushbulletSink {
    client: Client,
    endpoint: String,
    api_key: String,
    channel: Option<String>,
}

#[derive(Debug, Serialize)]
struct PushbulletNote<'a> {
    #[serde(rename = "type")]
    push_type: &'static str,
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_tag: Option<&'a str>,
}

impl PushbulletSink {
    pub fn new(config: PushbulletConfig) -> Result<Self, NotifyError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            endpoint: config
                .endpoint
                .unwrap_or_else(|| PUSHBULLET_PUSHES_URL.to_string()),
            api_key: config.api_key,
            channel: config.channel.filter(|c| !c.trim().is_empty()),
        })
    }

    fn note<'a>(&'a self, title: &'a str, body: &'a str) -> PushbulletNote<'a> {
        PushbulletNote {
            push_type: "note",
            title,
            body,
            channel_tag: self.channel.as_deref(),
        }
    }
}

#[async_trait]
impl NotificationSink for PushbulletSink {
    async fn push(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        debug!(title, channel = ?self.channel, "sending pushbullet note");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Access-Token", &self.api_key)
            .json(&self.note(title, body))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "pushbullet push failed");
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(title, "pushbullet note sent");
        Ok(())
    }
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn push(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        info!(title, body, "notification (dry run)");
        Ok(())
    }
}
