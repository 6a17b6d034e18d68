//! Out-of-band operator notifications.
//!
//! Delivery is fire-and-forget: a failed webhook call is logged and dropped so
//! it can never change how a request is retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

/// Severity of a notification. `Urgent` pings everyone watching the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    Urgent,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, description: Option<&str>, urgency: Urgency);
}

/// Delivers through `notifier`, dropping the message if the sink takes
/// longer than `timeout`.
pub async fn notify_within(
    notifier: &dyn Notifier,
    timeout: Duration,
    message: &str,
    description: Option<&str>,
    urgency: Urgency,
) {
    let sent = tokio::time::timeout(timeout, notifier.notify(message, description, urgency)).await;
    if sent.is_err() {
        warn!(message, "notification sink did not respond in time, dropping");
    }
}

/// Used when no sink is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, message: &str, _description: Option<&str>, _urgency: Urgency) {
        debug!(message, "notification sink not configured, dropping");
    }
}

/// Posts Discord-style webhook messages.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct WebhookMessage<'a> {
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<WebhookEmbed<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct WebhookEmbed<'a> {
    description: &'a str,
}

impl<'a> WebhookMessage<'a> {
    fn new(message: &str, description: Option<&'a str>, urgency: Urgency) -> Self {
        let content = match urgency {
            Urgency::Normal => message.to_string(),
            Urgency::Urgent => format!("@everyone {message}"),
        };
        Self {
            content,
            embeds: description
                .map(|description| vec![WebhookEmbed { description }])
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str, description: Option<&str>, urgency: Urgency) {
        let body = WebhookMessage::new(message, description, urgency);
        let sent = self.client.post(&self.url).json(&body).send().await;
        match sent.and_then(|res| res.error_for_status()) {
            Ok(_) => debug!(message, "notification delivered"),
            Err(err) => warn!(error = %err, message, "failed to deliver notification"),
        }
    }
}
