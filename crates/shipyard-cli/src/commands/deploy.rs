//! Local deploy command.

use anyhow::{Context, Result, bail};
use shipyard_config::{SystemConfig, load_stage_file};
use shipyard_core::notify::{NotificationChannel, Notifier};
use shipyard_core::source::SourceRepository;
use shipyard_core::{DeployStatus, MemoryStore, Store, User};
use shipyard_deployer::{DeployService, LogNotifier, NotifierRegistry, WebhookNotifier};
use shipyard_executor::{GitSourceRepository, LocalDirSource};
use shipyard_scheduler::JobExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::PrintObserver;

pub struct DeployArgs {
    pub stages: PathBuf,
    pub stage: String,
    pub reference: String,
    pub user: String,
    pub confirm_as: Option<String>,
    pub source: Option<PathBuf>,
    pub webhook: Option<String>,
}

/// Deploy a reference to one stage of a stage file and wait for the result.
pub async fn run(config: SystemConfig, args: DeployArgs) -> Result<()> {
    let file = load_stage_file(&args.stages)
        .with_context(|| format!("Failed to load stage file: {}", args.stages.display()))?;
    let stage = file
        .stage(&args.stage)
        .with_context(|| format!("Unknown stage: {}", args.stage))?
        .clone();

    let source: Arc<dyn SourceRepository> = match &args.source {
        Some(dir) => Arc::new(LocalDirSource::new(dir)),
        None if !file.project.repository_url.is_empty() => Arc::new(GitSourceRepository::new(
            file.project.repository_url.clone(),
        )),
        None => bail!(
            "Project {} has no source repository; pass --source",
            file.project.permalink
        ),
    };

    let store = Arc::new(MemoryStore::new());
    store.save_project(&file.project).await?;
    for stage in &file.stages {
        store.save_stage(stage).await?;
    }

    let executor = Arc::new(JobExecutor::new(&config.executor, store.clone()));
    let service = DeployService::new(
        store.clone(),
        executor,
        notifier_registry(args.webhook.as_deref())?,
        config.buddy_check.clone(),
    )
    .with_source(source);

    let requester = User::new(args.user);
    let deploy = service
        .deploy(stage.id, &args.reference, &requester)
        .await?;
    println!("Deploy {} of {} to {}", deploy.id, deploy.reference, stage.name);

    if deploy.status == DeployStatus::PendingConfirmation {
        let buddy = match args.confirm_as {
            Some(name) if name == requester.name => requester.clone(),
            Some(name) => User::new(name),
            None => {
                println!("Waiting for a buddy to confirm; rerun with --confirm-as <user>");
                return Ok(());
            }
        };
        info!(deploy_id = %deploy.id, user = %buddy.name, "Confirming deploy");
        service.confirm_deploy(deploy.id, &buddy).await?;
    }

    if let Some(execution) = service.execution(&deploy) {
        execution.subscribe(Arc::new(PrintObserver));
        execution.wait().await;
    }

    let deploy = store.get_deploy(deploy.id).await?;
    if deploy.status != DeployStatus::Succeeded {
        bail!("Deploy {} {}", deploy.id, deploy.status);
    }
    println!("Deploy {} succeeded", deploy.id);
    Ok(())
}

fn notifier_registry(webhook: Option<&str>) -> Result<NotifierRegistry> {
    let notifier: Arc<dyn Notifier> = match webhook {
        Some(url) => Arc::new(WebhookNotifier::parse(url)?),
        None => Arc::new(LogNotifier),
    };
    let mut registry = NotifierRegistry::new();
    for channel in NotificationChannel::POST_DEPLOY {
        registry.register(channel, notifier.clone());
    }
    registry.register(NotificationChannel::Bypass, notifier);
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_webhook_is_rejected() {
        assert!(notifier_registry(Some("not a url")).is_err());
        assert!(notifier_registry(None).is_ok());
    }

    #[tokio::test]
    async fn test_local_deploy_runs_stage_command() {
        let dir = tempfile::tempdir().unwrap();
        let stages = dir.path().join("shipyard.kdl");
        std::fs::write(
            &stages,
            r#"
project "billing"
stage "staging" command="test -f app.txt"
"#,
        )
        .unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("app.txt"), "v1").unwrap();

        let args = DeployArgs {
            stages,
            stage: "staging".to_string(),
            reference: "main".to_string(),
            user: "ana".to_string(),
            confirm_as: None,
            source: Some(source),
            webhook: None,
        };
        run(SystemConfig::default(), args).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_stage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stages = dir.path().join("shipyard.kdl");
        std::fs::write(&stages, "project \"billing\"\n").unwrap();

        let args = DeployArgs {
            stages,
            stage: "production".to_string(),
            reference: "main".to_string(),
            user: "ana".to_string(),
            confirm_as: None,
            source: Some(dir.path().to_path_buf()),
            webhook: None,
        };
        assert!(run(SystemConfig::default(), args).await.is_err());
    }
}
