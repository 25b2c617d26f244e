//! Persistence collaborator.
//!
//! The core only needs durable identifiers, an atomic job+deploy insert and
//! optimistic job status updates. `MemoryStore` backs tests and the CLI.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::build::Build;
use crate::deploy::{Deploy, DeployStatus};
use crate::id::{BuildId, DeployId, JobId, ProjectId, StageId};
use crate::job::{Job, JobStatus};
use crate::project::Project;
use crate::stage::Stage;
use crate::{Error, Result};

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: ProjectId) -> Result<Project>;

    async fn save_stage(&self, stage: &Stage) -> Result<()>;

    async fn get_stage(&self, id: StageId) -> Result<Stage>;

    async fn stages_for_project(&self, project_id: ProjectId) -> Result<Vec<Stage>>;

    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// Persist a job whose status moved from `expected`. Fails with
    /// `Error::State` if the stored job is no longer in `expected`.
    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<()>;

    /// Insert a job and the deploy that owns it as one unit.
    async fn create_deploy(&self, job: &Job, deploy: &Deploy) -> Result<()>;

    async fn get_deploy(&self, id: DeployId) -> Result<Deploy>;

    /// Persist a deploy whose status moved from `expected`. Fails with
    /// `Error::State` if the stored deploy is no longer in `expected`.
    async fn update_deploy(&self, deploy: &Deploy, expected: DeployStatus) -> Result<()>;

    /// Deploys of a stage, newest first.
    async fn deploys_for_stage(&self, stage_id: StageId) -> Result<Vec<Deploy>>;

    async fn save_build(&self, build: &Build) -> Result<()>;

    async fn get_build(&self, id: BuildId) -> Result<Build>;
}

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    stages: HashMap<StageId, Stage>,
    jobs: HashMap<JobId, Job>,
    deploys: HashMap<DeployId, Deploy>,
    builds: HashMap<BuildId, Build>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_project(&self, project: &Project) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .projects
            .values()
            .any(|p| p.permalink == project.permalink && p.id != project.id)
        {
            return Err(Error::Validation(format!(
                "project permalink '{}' is already taken",
                project.permalink
            )));
        }
        tables.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.tables
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("project", id))
    }

    async fn save_stage(&self, stage: &Stage) -> Result<()> {
        self.tables
            .write()
            .await
            .stages
            .insert(stage.id, stage.clone());
        Ok(())
    }

    async fn get_stage(&self, id: StageId) -> Result<Stage> {
        self.tables
            .read()
            .await
            .stages
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("stage", id))
    }

    async fn stages_for_project(&self, project_id: ProjectId) -> Result<Vec<Stage>> {
        let tables = self.tables.read().await;
        let mut stages: Vec<Stage> = tables
            .stages
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.id);
        Ok(stages)
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) {
            return Err(Error::State(format!("job {} already exists", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.tables
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("job", id))
    }

    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| not_found("job", job.id))?;
        if stored.status != expected {
            return Err(Error::State(format!(
                "job {} is {} but update expected {}",
                job.id, stored.status, expected
            )));
        }
        if job.status != expected && !expected.can_transition_to(job.status) {
            return Err(Error::State(format!(
                "job {} cannot move from {} to {}",
                job.id, expected, job.status
            )));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn create_deploy(&self, job: &Job, deploy: &Deploy) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) || tables.deploys.contains_key(&deploy.id) {
            return Err(Error::State(format!(
                "deploy {} or job {} already exists",
                deploy.id, job.id
            )));
        }
        if deploy.job_id != job.id {
            return Err(Error::Validation(format!(
                "deploy {} does not reference job {}",
                deploy.id, job.id
            )));
        }
        tables.jobs.insert(job.id, job.clone());
        tables.deploys.insert(deploy.id, deploy.clone());
        Ok(())
    }

    async fn get_deploy(&self, id: DeployId) -> Result<Deploy> {
        self.tables
            .read()
            .await
            .deploys
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("deploy", id))
    }

    async fn update_deploy(&self, deploy: &Deploy, expected: DeployStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .deploys
            .get_mut(&deploy.id)
            .ok_or_else(|| not_found("deploy", deploy.id))?;
        if stored.status != expected {
            return Err(Error::State(format!(
                "deploy {} is {} but update expected {}",
                deploy.id, stored.status, expected
            )));
        }
        *stored = deploy.clone();
        Ok(())
    }

    async fn deploys_for_stage(&self, stage_id: StageId) -> Result<Vec<Deploy>> {
        let tables = self.tables.read().await;
        let mut deploys: Vec<Deploy> = tables
            .deploys
            .values()
            .filter(|d| d.stage_id == stage_id)
            .cloned()
            .collect();
        deploys.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(deploys)
    }

    async fn save_build(&self, build: &Build) -> Result<()> {
        self.tables
            .write()
            .await
            .builds
            .insert(build.id, build.clone());
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        self.tables
            .read()
            .await
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("build", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::UserId;
    use crate::project::Reference;

    fn job() -> Job {
        Job::new("true", Reference::parse("main").unwrap(), None)
    }

    #[tokio::test]
    async fn test_create_deploy_inserts_job_and_deploy() {
        let store = MemoryStore::new();
        let job = job();
        let deploy = Deploy::new(
            ProjectId::new(),
            StageId::new(),
            job.reference.clone(),
            job.id,
            UserId::new(),
        );

        store.create_deploy(&job, &deploy).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().id, job.id);
        assert_eq!(store.get_deploy(deploy.id).await.unwrap().job_id, job.id);
    }

    #[tokio::test]
    async fn test_create_deploy_with_mismatched_job_writes_nothing() {
        let store = MemoryStore::new();
        let job = job();
        let deploy = Deploy::new(
            ProjectId::new(),
            StageId::new(),
            job.reference.clone(),
            JobId::new(),
            UserId::new(),
        );

        assert!(store.create_deploy(&job, &deploy).await.is_err());
        assert!(matches!(
            store.get_job(job.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_job_is_optimistic() {
        let store = MemoryStore::new();
        let mut job = job();
        store.create_job(&job).await.unwrap();

        job.transition(JobStatus::Running).unwrap();
        store.update_job(&job, JobStatus::Pending).await.unwrap();

        // A second writer that still thinks the job is pending loses.
        let mut stale = job.clone();
        stale.status = JobStatus::Cancelled;
        assert!(matches!(
            store.update_job(&stale, JobStatus::Pending).await,
            Err(Error::State(_))
        ));

        job.transition(JobStatus::Succeeded).unwrap();
        store.update_job(&job, JobStatus::Running).await.unwrap();

        let mut late = job.clone();
        late.status = JobStatus::Failed;
        assert!(store.update_job(&late, JobStatus::Succeeded).await.is_err());
        assert_eq!(
            store.get_job(job.id).await.unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_update_deploy_is_optimistic() {
        let store = MemoryStore::new();
        let job = job();
        let deploy = Deploy::new(
            ProjectId::new(),
            StageId::new(),
            job.reference.clone(),
            job.id,
            UserId::new(),
        );
        store.create_deploy(&job, &deploy).await.unwrap();

        let mut first = deploy.clone();
        first.start(None).unwrap();
        store
            .update_deploy(&first, DeployStatus::PendingConfirmation)
            .await
            .unwrap();

        let mut second = deploy.clone();
        second.start(Some(UserId::new())).unwrap();
        assert!(matches!(
            store
                .update_deploy(&second, DeployStatus::PendingConfirmation)
                .await,
            Err(Error::State(_))
        ));
        assert_eq!(store.get_deploy(deploy.id).await.unwrap().buddy_id, None);
    }

    #[tokio::test]
    async fn test_duplicate_permalink_is_rejected() {
        let store = MemoryStore::new();
        store
            .save_project(&Project::new("billing", "git@x:billing", "r/billing"))
            .await
            .unwrap();
        let err = store
            .save_project(&Project::new("billing", "git@x:other", "r/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
