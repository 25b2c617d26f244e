//! Deploy lifecycle: creation, buddy check, confirmation and completion.

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

use shipyard_config::BuddyCheckConfig;
use shipyard_core::source::SourceRepository;
use shipyard_core::{
    Deploy, DeployId, DeployStatus, Error, Job, JobStatus, PipelineGraph, Reference, Result,
    Stage, StageId, Store, User, UserId,
};
use shipyard_scheduler::{CommandWorkUnit, JobExecution, JobExecutor};

use crate::notifications::NotifierRegistry;

/// Creates deploys, gates them behind the buddy check and runs them.
pub struct DeployService {
    store: Arc<dyn Store>,
    executor: Arc<JobExecutor>,
    notifiers: NotifierRegistry,
    buddy_check: BuddyCheckConfig,
    source: Option<Arc<dyn SourceRepository>>,
}

impl DeployService {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<JobExecutor>,
        notifiers: NotifierRegistry,
        buddy_check: BuddyCheckConfig,
    ) -> Self {
        Self {
            store,
            executor,
            notifiers,
            buddy_check,
            source: None,
        }
    }

    /// Check out the deployed reference into the job's working directory
    /// before the stage command runs.
    pub fn with_source(mut self, source: Arc<dyn SourceRepository>) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a deploy of `reference` to a stage.
    ///
    /// The job and deploy are stored together and pre-deploy notifications go
    /// out. The deploy is confirmed right away when [`Self::auto_confirm`]
    /// allows it; otherwise it waits for [`Self::confirm_deploy`].
    pub async fn deploy(&self, stage_id: StageId, reference: &str, user: &User) -> Result<Deploy> {
        let span = info_span!("deploy", stage_id = %stage_id, reference, user = %user.name);
        async move {
            let stage = match self.store.get_stage(stage_id).await {
                Ok(stage) => stage,
                Err(Error::NotFound(_)) => {
                    return Err(Error::Validation(format!("stage {} does not exist", stage_id)));
                }
                Err(e) => return Err(e),
            };
            let reference = Reference::parse(reference)?;
            if stage.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "stage {} has no deploy command",
                    stage.name
                )));
            }

            let job = Job::new(stage.command.clone(), reference.clone(), Some(user.id));
            let deploy = Deploy::new(stage.project_id, stage.id, reference, job.id, user.id);
            self.store.create_deploy(&job, &deploy).await?;
            info!(deploy_id = %deploy.id, job_id = %job.id, "Deploy created");

            self.notifiers.notify_created(&deploy, &stage, Some(user)).await;

            match self.auto_confirmation(&stage, user).await? {
                AutoConfirm::No => {
                    info!(deploy_id = %deploy.id, "Waiting for buddy confirmation");
                    Ok(deploy)
                }
                AutoConfirm::Yes { buddy } => {
                    let (deploy, _) = self.start(deploy, &stage, job, buddy).await?;
                    Ok(deploy)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Confirm a pending deploy and start its job.
    ///
    /// When the stage needs a buddy and `confirming_user` is not the
    /// requester, the confirmation is recorded as the buddy approval and a
    /// bypass notification is sent.
    pub async fn confirm_deploy(
        &self,
        deploy_id: DeployId,
        confirming_user: &User,
    ) -> Result<JobExecution> {
        let span = info_span!("confirm_deploy", deploy_id = %deploy_id, user = %confirming_user.name);
        async move {
            let deploy = self.store.get_deploy(deploy_id).await?;
            if !deploy.is_confirmable() {
                return Err(Error::State(format!(
                    "deploy {} is {} and cannot be confirmed",
                    deploy.id, deploy.status
                )));
            }
            let stage = self.store.get_stage(deploy.stage_id).await?;
            let job = self.store.get_job(deploy.job_id).await?;

            let buddy_approval = self.buddy_check_required(&stage).await?
                && confirming_user.id != deploy.requested_by;
            let buddy = buddy_approval.then_some(confirming_user.id);

            let (deploy, execution) = self.start(deploy, &stage, job, buddy).await?;
            if buddy_approval {
                info!(buddy = %confirming_user.name, "Deploy confirmed by buddy");
                self.notifiers
                    .notify_bypass(&deploy, &stage, Some(confirming_user))
                    .await;
            }
            Ok(execution)
        }
        .instrument(span)
        .await
    }

    /// Whether a deploy of `stage` by `user` may start without a buddy.
    pub async fn auto_confirm(&self, stage: &Stage, user: &User) -> Result<bool> {
        Ok(matches!(
            self.auto_confirmation(stage, user).await?,
            AutoConfirm::Yes { .. }
        ))
    }

    /// Buddy checks apply when enabled, the stage does not opt out and the
    /// stage is production or leads to one.
    pub async fn buddy_check_required(&self, stage: &Stage) -> Result<bool> {
        if !self.buddy_check.enabled || stage.skip_buddy_check {
            return Ok(false);
        }
        let stages = self.store.stages_for_project(stage.project_id).await?;
        Ok(PipelineGraph::new(&stages).is_effectively_production(stage))
    }

    /// Cancel a deploy. A pending deploy is closed directly; a running one has
    /// its job cancelled and finishes through the usual completion path.
    pub async fn cancel_deploy(&self, deploy_id: DeployId) -> Result<Deploy> {
        let mut deploy = self.store.get_deploy(deploy_id).await?;
        match deploy.status {
            DeployStatus::PendingConfirmation => {
                deploy.finish(JobStatus::Cancelled)?;
                self.store
                    .update_deploy(&deploy, DeployStatus::PendingConfirmation)
                    .await?;
                let mut job = self.store.get_job(deploy.job_id).await?;
                job.transition(JobStatus::Cancelled)?;
                self.store.update_job(&job, JobStatus::Pending).await?;
                info!(deploy_id = %deploy.id, "Pending deploy cancelled");
                Ok(deploy)
            }
            DeployStatus::Running => {
                if !self.executor.cancel(deploy.job_id) {
                    warn!(deploy_id = %deploy.id, "Running deploy has no active execution");
                }
                Ok(deploy)
            }
            status => Err(Error::State(format!(
                "deploy {} is {} and cannot be cancelled",
                deploy.id, status
            ))),
        }
    }

    /// The live execution of a deploy, if its job is still queued or running.
    pub fn execution(&self, deploy: &Deploy) -> Option<JobExecution> {
        self.executor.active(deploy.job_id)
    }

    async fn auto_confirmation(&self, stage: &Stage, user: &User) -> Result<AutoConfirm> {
        if !self.buddy_check_required(stage).await? {
            return Ok(AutoConfirm::Yes { buddy: None });
        }

        let deploys = self.store.deploys_for_stage(stage.id).await?;
        let Some(previous) = deploys
            .iter()
            .find(|d| d.requested_by == user.id && d.status.is_terminal())
        else {
            return Ok(AutoConfirm::No);
        };

        let grace = TimeDelta::from_std(self.buddy_check.grace_period).unwrap_or(TimeDelta::MAX);
        let within_grace = previous
            .finished_at
            .is_some_and(|finished| Utc::now() - finished <= grace);
        let approved_by_buddy = previous.buddy_id.is_some_and(|b| b != user.id);

        if previous.status == DeployStatus::Succeeded && approved_by_buddy && within_grace {
            info!(previous = %previous.id, "Reusing recent buddy approval");
            return Ok(AutoConfirm::Yes {
                buddy: previous.buddy_id,
            });
        }
        Ok(AutoConfirm::No)
    }

    async fn start(
        &self,
        mut deploy: Deploy,
        stage: &Stage,
        job: Job,
        buddy: Option<UserId>,
    ) -> Result<(Deploy, JobExecution)> {
        let expected = deploy.status;
        deploy.start(buddy)?;
        // Only one confirmation can move the stored deploy out of pending.
        self.store.update_deploy(&deploy, expected).await?;

        let mut work = CommandWorkUnit::new(job.command.clone())
            .env("DEPLOY_REFERENCE", deploy.reference.as_str())
            .env("DEPLOY_STAGE", stage.name.clone())
            .env("DEPLOY_ID", deploy.id.to_string());
        if let Some(source) = &self.source {
            work = work.with_checkout(source.clone(), deploy.reference.clone());
        }

        let execution = self
            .executor
            .start(deploy.reference.clone(), job, work)
            .await?;
        info!(deploy_id = %deploy.id, job_id = %execution.job_id(), "Deploy started");

        let store = self.store.clone();
        let notifiers = self.notifiers.clone();
        let deploy_id = deploy.id;
        let stage = stage.clone();
        execution
            .on_complete(move |job| async move {
                record_completion(store, notifiers, deploy_id, stage, job).await
            })
            .await;

        Ok((deploy, execution))
    }
}

enum AutoConfirm {
    No,
    Yes { buddy: Option<UserId> },
}

async fn record_completion(
    store: Arc<dyn Store>,
    notifiers: NotifierRegistry,
    deploy_id: DeployId,
    stage: Stage,
    job: Job,
) {
    let mut deploy = match store.get_deploy(deploy_id).await {
        Ok(deploy) => deploy,
        Err(e) => {
            error!(deploy_id = %deploy_id, error = %e, "Failed to load finished deploy");
            return;
        }
    };
    let expected = deploy.status;
    if let Err(e) = deploy.finish(job.status) {
        warn!(deploy_id = %deploy_id, error = %e, "Deploy already finished");
        return;
    }
    if let Err(e) = store.update_deploy(&deploy, expected).await {
        error!(deploy_id = %deploy_id, error = %e, "Failed to record deploy status");
        return;
    }
    info!(deploy_id = %deploy_id, status = %deploy.status, "Deploy finished");

    notifiers.notify_finished(&deploy, &stage).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::tests::{RecordingNotifier, registry_for_all};
    use shipyard_config::ExecutorConfig;
    use shipyard_core::notify::{NotificationChannel, NotificationPhase};
    use shipyard_core::{MemoryStore, Project};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        service: DeployService,
        notifications: Arc<RecordingNotifier>,
        project: Project,
    }

    impl Harness {
        async fn new(buddy_check: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            let executor = Arc::new(JobExecutor::new(&ExecutorConfig::default(), store.clone()));
            let notifications = Arc::new(RecordingNotifier::default());
            let service = DeployService::new(
                store.clone(),
                executor,
                registry_for_all(notifications.clone()),
                BuddyCheckConfig {
                    enabled: buddy_check,
                    grace_period: Duration::from_secs(3600),
                },
            );
            let project = Project::new(
                "billing",
                "https://github.com/acme/billing.git",
                "registry.example.com/billing",
            );
            store.save_project(&project).await.unwrap();
            Self {
                store,
                service,
                notifications,
                project,
            }
        }

        async fn stage(&self, name: &str, command: &str, configure: impl FnOnce(&mut Stage)) -> Stage {
            let mut stage = Stage::new(self.project.id, name, command);
            configure(&mut stage);
            self.store.save_stage(&stage).await.unwrap();
            stage
        }

        /// Wait for the deploy's job and completion hook, then reload it.
        async fn settle(&self, deploy: &Deploy) -> Deploy {
            if let Some(execution) = self.service.execution(deploy) {
                execution.wait().await;
            }
            self.store.get_deploy(deploy.id).await.unwrap()
        }

        fn count(&self, channel: NotificationChannel, phase: NotificationPhase) -> usize {
            self.notifications.count(channel, phase)
        }
    }

    #[tokio::test]
    async fn test_deploy_without_buddy_check_runs_to_success() {
        let h = Harness::new(false).await;
        let stage = h.stage("staging", "true", |_| {}).await;
        let user = User::new("ana");

        let deploy = h.service.deploy(stage.id, "main", &user).await.unwrap();
        assert_eq!(deploy.status, DeployStatus::Running);

        let deploy = h.settle(&deploy).await;
        assert_eq!(deploy.status, DeployStatus::Succeeded);
        assert!(deploy.finished_at.is_some());
        let job = h.store.get_job(deploy.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_each_deploy_gets_its_own_job() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let user = User::new("ana");

        let first = h.service.deploy(stage.id, "main", &user).await.unwrap();
        let second = h.service.deploy(stage.id, "main", &user).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(h.store.deploys_for_stage(stage.id).await.unwrap().len(), 2);
        h.store.get_job(first.job_id).await.unwrap();
        h.store.get_job(second.job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_buddy_required_deploy_waits_for_confirmation() {
        let h = Harness::new(true).await;
        let stage = h
            .stage("production", "true", |s| {
                s.production = true;
                s.chat_notifications = true;
            })
            .await;
        let user = User::new("ana");

        let deploy = h.service.deploy(stage.id, "main", &user).await.unwrap();

        assert_eq!(deploy.status, DeployStatus::PendingConfirmation);
        assert!(h.service.execution(&deploy).is_none());
        let job = h.store.get_job(deploy.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        // Pre-deploy notifications go out regardless of the buddy check.
        assert_eq!(h.count(NotificationChannel::Chat, NotificationPhase::Created), 1);
        assert!(!h.service.auto_confirm(&stage, &user).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_leading_to_production_needs_buddy() {
        let h = Harness::new(true).await;
        let production = h.stage("production", "true", |s| s.production = true).await;
        let staging = h
            .stage("staging", "true", |s| s.next_stage_ids = vec![Some(production.id)])
            .await;
        let canary = h
            .stage("canary", "true", |s| {
                s.next_stage_ids = vec![Some(production.id)];
                s.skip_buddy_check = true;
            })
            .await;

        assert!(h.service.buddy_check_required(&staging).await.unwrap());
        assert!(!h.service.buddy_check_required(&canary).await.unwrap());
    }

    #[tokio::test]
    async fn test_buddy_confirmation_sends_one_bypass_notification() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let requester = User::new("ana");
        let buddy = User::new("ben");

        let deploy = h.service.deploy(stage.id, "main", &requester).await.unwrap();
        let execution = h.service.confirm_deploy(deploy.id, &buddy).await.unwrap();
        execution.wait().await;

        let deploy = h.store.get_deploy(deploy.id).await.unwrap();
        assert_eq!(deploy.buddy_id, Some(buddy.id));
        assert_eq!(deploy.status, DeployStatus::Succeeded);
        assert_eq!(h.count(NotificationChannel::Bypass, NotificationPhase::Bypass), 1);
    }

    #[tokio::test]
    async fn test_self_confirmation_sends_no_bypass_notification() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let requester = User::new("ana");

        let deploy = h.service.deploy(stage.id, "main", &requester).await.unwrap();
        let execution = h.service.confirm_deploy(deploy.id, &requester).await.unwrap();
        execution.wait().await;

        let deploy = h.store.get_deploy(deploy.id).await.unwrap();
        assert_eq!(deploy.buddy_id, None);
        assert_eq!(h.count(NotificationChannel::Bypass, NotificationPhase::Bypass), 0);
    }

    #[tokio::test]
    async fn test_confirming_twice_is_a_state_error() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let requester = User::new("ana");
        let buddy = User::new("ben");

        let deploy = h.service.deploy(stage.id, "main", &requester).await.unwrap();
        let execution = h.service.confirm_deploy(deploy.id, &buddy).await.unwrap();
        execution.wait().await;

        let again = h.service.confirm_deploy(deploy.id, &buddy).await;
        assert!(matches!(again, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn test_concurrent_confirmations_start_once() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let requester = User::new("ana");
        let ben = User::new("ben");
        let cy = User::new("cy");

        let deploy = h.service.deploy(stage.id, "main", &requester).await.unwrap();
        let (first, second) = tokio::join!(
            h.service.confirm_deploy(deploy.id, &ben),
            h.service.confirm_deploy(deploy.id, &cy),
        );

        let (winner, loser) = match (first, second) {
            (Ok(execution), Err(e)) | (Err(e), Ok(execution)) => (execution, e),
            (first, second) => panic!(
                "expected exactly one confirmation to win: {:?} {:?}",
                first.map(|e| e.job_id()),
                second.map(|e| e.job_id())
            ),
        };
        assert!(matches!(loser, Error::State(_)));
        winner.wait().await;

        let deploy = h.store.get_deploy(deploy.id).await.unwrap();
        assert_eq!(deploy.status, DeployStatus::Succeeded);
        assert!(deploy.buddy_id == Some(ben.id) || deploy.buddy_id == Some(cy.id));
        assert_eq!(h.count(NotificationChannel::Bypass, NotificationPhase::Bypass), 1);
    }

    #[tokio::test]
    async fn test_recent_buddy_approval_auto_confirms_same_user() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let requester = User::new("ana");
        let buddy = User::new("ben");
        let stranger = User::new("cy");

        let first = h.service.deploy(stage.id, "v1", &requester).await.unwrap();
        h.service
            .confirm_deploy(first.id, &buddy)
            .await
            .unwrap()
            .wait()
            .await;

        assert!(h.service.auto_confirm(&stage, &requester).await.unwrap());
        assert!(!h.service.auto_confirm(&stage, &stranger).await.unwrap());

        let second = h.service.deploy(stage.id, "v2", &requester).await.unwrap();
        assert_eq!(second.status, DeployStatus::Running);
        assert_eq!(second.buddy_id, Some(buddy.id));
        assert_eq!(h.settle(&second).await.status, DeployStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_email_only_stage_delivers_exactly_one_email() {
        let h = Harness::new(false).await;
        let stage = h
            .stage("staging", "true", |s| s.send_email_notifications = true)
            .await;

        let deploy = h
            .service
            .deploy(stage.id, "main", &User::new("ana"))
            .await
            .unwrap();
        h.settle(&deploy).await;

        assert_eq!(h.count(NotificationChannel::Email, NotificationPhase::Finished), 1);
        for channel in [
            NotificationChannel::Chat,
            NotificationChannel::Metrics,
            NotificationChannel::CommitStatus,
            NotificationChannel::DeploymentApi,
        ] {
            assert_eq!(h.count(channel, NotificationPhase::Finished), 0, "{}", channel);
        }
    }

    #[tokio::test]
    async fn test_failed_deploy_skips_commit_status() {
        let h = Harness::new(false).await;
        let stage = h
            .stage("staging", "exit 1", |s| {
                s.update_commit_status = true;
                s.chat_notifications = true;
            })
            .await;

        let deploy = h
            .service
            .deploy(stage.id, "main", &User::new("ana"))
            .await
            .unwrap();
        let deploy = h.settle(&deploy).await;

        assert_eq!(deploy.status, DeployStatus::Failed);
        assert_eq!(
            h.count(NotificationChannel::CommitStatus, NotificationPhase::Finished),
            0
        );
        assert_eq!(h.count(NotificationChannel::Chat, NotificationPhase::Finished), 1);
    }

    #[tokio::test]
    async fn test_command_sees_deploy_environment() {
        let h = Harness::new(false).await;
        let stage = h
            .stage("staging", "test \"$DEPLOY_STAGE\" = staging && test \"$DEPLOY_REFERENCE\" = v9", |_| {})
            .await;

        let deploy = h
            .service
            .deploy(stage.id, "v9", &User::new("ana"))
            .await
            .unwrap();
        assert_eq!(h.settle(&deploy).await.status, DeployStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_validation_errors() {
        let h = Harness::new(false).await;
        let stage = h.stage("staging", "true", |_| {}).await;
        let empty = h.stage("empty", "  ", |_| {}).await;
        let user = User::new("ana");

        let missing = h.service.deploy(StageId::new(), "main", &user).await;
        assert!(matches!(missing, Err(Error::Validation(_))));

        let bad_ref = h.service.deploy(stage.id, "main branch", &user).await;
        assert!(matches!(bad_ref, Err(Error::Validation(_))));

        let no_command = h.service.deploy(empty.id, "main", &user).await;
        assert!(matches!(no_command, Err(Error::Validation(_))));

        assert!(h.store.deploys_for_stage(stage.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_deploy() {
        let h = Harness::new(true).await;
        let stage = h.stage("production", "true", |s| s.production = true).await;
        let user = User::new("ana");

        let deploy = h.service.deploy(stage.id, "main", &user).await.unwrap();
        let cancelled = h.service.cancel_deploy(deploy.id).await.unwrap();

        assert_eq!(cancelled.status, DeployStatus::Cancelled);
        let job = h.store.get_job(deploy.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(matches!(
            h.service.confirm_deploy(deploy.id, &user).await,
            Err(Error::State(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_deploy() {
        let h = Harness::new(false).await;
        let stage = h.stage("staging", "sleep 30", |_| {}).await;

        let deploy = h
            .service
            .deploy(stage.id, "main", &User::new("ana"))
            .await
            .unwrap();
        let execution = h.service.execution(&deploy).unwrap();
        h.service.cancel_deploy(deploy.id).await.unwrap();
        execution.wait().await;

        let deploy = h.store.get_deploy(deploy.id).await.unwrap();
        assert_eq!(deploy.status, DeployStatus::Cancelled);
    }
}
