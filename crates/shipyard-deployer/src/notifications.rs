//! Notification dispatch for deploys.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use shipyard_core::notify::{
    DeliveryPolicy, Notification, NotificationChannel, NotificationPhase, Notifier,
};
use shipyard_core::{Deploy, DeployStatus, Result, Stage, User};

/// One notifier per channel. Channels without a notifier are skipped.
#[derive(Default, Clone)]
pub struct NotifierRegistry {
    notifiers: HashMap<NotificationChannel, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: NotificationChannel, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(channel, notifier);
    }

    pub fn with(mut self, channel: NotificationChannel, notifier: Arc<dyn Notifier>) -> Self {
        self.register(channel, notifier);
        self
    }

    /// Channels that hear about a deploy as soon as it is created.
    pub async fn notify_created(&self, deploy: &Deploy, stage: &Stage, actor: Option<&User>) {
        let channels = NotificationChannel::PRE_DEPLOY
            .into_iter()
            .filter(|c| c.is_enabled_for(stage));
        self.dispatch(channels, NotificationPhase::Created, deploy, stage, actor)
            .await;
    }

    /// Channels enabled on the stage, filtered by each channel's delivery
    /// policy against the deploy's terminal status.
    pub async fn notify_finished(&self, deploy: &Deploy, stage: &Stage) {
        let succeeded = deploy.status == DeployStatus::Succeeded;
        let channels = NotificationChannel::POST_DEPLOY
            .into_iter()
            .filter(|c| c.is_enabled_for(stage))
            .filter(|c| match c.delivery_policy() {
                DeliveryPolicy::OnSuccess => succeeded,
                DeliveryPolicy::AnyOutcome => true,
            });
        self.dispatch(channels, NotificationPhase::Finished, deploy, stage, None)
            .await;
    }

    pub async fn notify_bypass(&self, deploy: &Deploy, stage: &Stage, actor: Option<&User>) {
        self.dispatch(
            [NotificationChannel::Bypass],
            NotificationPhase::Bypass,
            deploy,
            stage,
            actor,
        )
        .await;
    }

    /// Deliver on every channel concurrently. Each delivery runs in its own
    /// task; errors and panics are logged and never reach other channels.
    async fn dispatch(
        &self,
        channels: impl IntoIterator<Item = NotificationChannel>,
        phase: NotificationPhase,
        deploy: &Deploy,
        stage: &Stage,
        actor: Option<&User>,
    ) {
        let deliveries: Vec<_> = channels
            .into_iter()
            .filter_map(|channel| {
                let notifier = self.notifiers.get(&channel)?.clone();
                let notification = Notification {
                    channel,
                    phase,
                    deploy: deploy.clone(),
                    stage: stage.clone(),
                    actor: actor.cloned(),
                };
                let handle =
                    tokio::spawn(async move { notifier.deliver(&notification).await });
                Some((channel, handle))
            })
            .collect();

        let (channels, handles): (Vec<_>, Vec<_>) = deliveries.into_iter().unzip();
        for (channel, result) in channels.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%channel, deploy_id = %deploy.id, error = %e, "Notification failed")
                }
                Err(e) => {
                    error!(%channel, deploy_id = %deploy.id, error = %e, "Notifier panicked")
                }
            }
        }
    }
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            channel = %notification.channel,
            phase = ?notification.phase,
            deploy_id = %notification.deploy.id,
            stage = %notification.stage.name,
            status = %notification.deploy.status,
            "Deploy notification"
        );
        Ok(())
    }
}
