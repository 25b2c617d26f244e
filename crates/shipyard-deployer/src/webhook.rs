//! Webhook notifier: POSTs a JSON summary of the notification.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use shipyard_core::notify::{Notification, NotificationChannel, NotificationPhase, Notifier};
use shipyard_core::{DeployStatus, Error, Result};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    channel: NotificationChannel,
    phase: NotificationPhase,
    deploy_id: String,
    project_id: String,
    stage: &'a str,
    reference: &'a str,
    status: DeployStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tags: &'a [String],
}

impl<'a> From<&'a Notification> for WebhookPayload<'a> {
    fn from(n: &'a Notification) -> Self {
        Self {
            channel: n.channel,
            phase: n.phase,
            deploy_id: n.deploy.id.to_string(),
            project_id: n.deploy.project_id.to_string(),
            stage: &n.stage.name,
            reference: n.deploy.reference.as_str(),
            status: n.deploy.status,
            actor: n.actor.as_ref().map(|u| u.name.as_str()),
            tags: if n.channel == NotificationChannel::Metrics {
                &n.stage.metrics_tags
            } else {
                &[]
            },
        }
    }
}

/// Delivers notifications to an HTTP endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token: None,
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Validation(format!("invalid webhook url {}: {}", url, e)))?;
        Ok(Self::new(url))
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload::from(notification);
        debug!(url = %self.url, channel = %notification.channel, "Posting webhook");

        let mut request = self
            .client
            .post(self.url.clone())
            .header("User-Agent", "Shipyard")
            .json(&payload);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "webhook returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }
}
