//! Notification channels and the notifier collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::deploy::Deploy;
use crate::project::User;
use crate::stage::Stage;

/// External channels a deploy can report to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Chat,
    Metrics,
    CommitStatus,
    DeploymentApi,
    /// Reviewers told that a buddy confirmed someone else's deploy.
    Bypass,
}

/// When a post-deploy notification is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    OnSuccess,
    AnyOutcome,
}

impl NotificationChannel {
    /// Channels considered after a deploy reaches a terminal status.
    pub const POST_DEPLOY: [NotificationChannel; 5] = [
        NotificationChannel::Email,
        NotificationChannel::Chat,
        NotificationChannel::Metrics,
        NotificationChannel::CommitStatus,
        NotificationChannel::DeploymentApi,
    ];

    /// Channels pinged when a deploy is created.
    pub const PRE_DEPLOY: [NotificationChannel; 2] =
        [NotificationChannel::Chat, NotificationChannel::DeploymentApi];

    pub fn is_enabled_for(&self, stage: &Stage) -> bool {
        match self {
            NotificationChannel::Email => stage.send_email_notifications,
            NotificationChannel::Chat => stage.chat_notifications,
            NotificationChannel::Metrics => !stage.metrics_tags.is_empty(),
            NotificationChannel::CommitStatus => stage.update_commit_status,
            NotificationChannel::DeploymentApi => stage.use_deployment_api,
            NotificationChannel::Bypass => true,
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        match self {
            NotificationChannel::CommitStatus => DeliveryPolicy::OnSuccess,
            _ => DeliveryPolicy::AnyOutcome,
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Chat => "chat",
            NotificationChannel::Metrics => "metrics",
            NotificationChannel::CommitStatus => "commit_status",
            NotificationChannel::DeploymentApi => "deployment_api",
            NotificationChannel::Bypass => "bypass",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPhase {
    Created,
    Finished,
    Bypass,
}

/// Everything a notifier gets to see about a deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub channel: NotificationChannel,
    pub phase: NotificationPhase,
    pub deploy: Deploy,
    pub stage: Stage,
    /// The confirming operator for bypass notifications.
    pub actor: Option<User>,
}

/// Delivers notifications on one channel. How delivery happens is up to the
/// implementation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}
