//! Deploys: one attempt to ship a reference to a stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeployId, JobId, ProjectId, StageId, UserId};
use crate::job::JobStatus;
use crate::project::Reference;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    /// Waiting for a buddy (or the policy) to confirm.
    PendingConfirmation,
    Running,
    Succeeded,
    Failed,
    Errored,
    Cancelled,
}

impl DeployStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            DeployStatus::PendingConfirmation | DeployStatus::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::PendingConfirmation => "pending_confirmation",
            DeployStatus::Running => "running",
            DeployStatus::Succeeded => "succeeded",
            DeployStatus::Failed => "failed",
            DeployStatus::Errored => "errored",
            DeployStatus::Cancelled => "cancelled",
        }
    }
}

impl From<JobStatus> for DeployStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => DeployStatus::PendingConfirmation,
            JobStatus::Running => DeployStatus::Running,
            JobStatus::Succeeded => DeployStatus::Succeeded,
            JobStatus::Failed => DeployStatus::Failed,
            JobStatus::Errored => DeployStatus::Errored,
            JobStatus::Cancelled => DeployStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deploy {
    pub id: DeployId,
    pub project_id: ProjectId,
    pub stage_id: StageId,
    pub reference: Reference,
    pub job_id: JobId,
    pub requested_by: UserId,
    /// Set when a different operator confirmed the deploy.
    pub buddy_id: Option<UserId>,
    pub status: DeployStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deploy {
    pub fn new(
        project_id: ProjectId,
        stage_id: StageId,
        reference: Reference,
        job_id: JobId,
        requested_by: UserId,
    ) -> Self {
        Self {
            id: DeployId::new(),
            project_id,
            stage_id,
            reference,
            job_id,
            requested_by,
            buddy_id: None,
            status: DeployStatus::PendingConfirmation,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_confirmable(&self) -> bool {
        self.status == DeployStatus::PendingConfirmation
    }

    /// Record confirmation and move to running.
    pub fn start(&mut self, buddy: Option<UserId>) -> Result<()> {
        if !self.is_confirmable() {
            return Err(Error::State(format!(
                "deploy {} is {} and cannot be confirmed",
                self.id, self.status
            )));
        }
        self.buddy_id = buddy;
        self.status = DeployStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mirror the job's terminal status.
    pub fn finish(&mut self, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::State(format!(
                "deploy {} cannot finish with non-terminal status {}",
                self.id, status
            )));
        }
        if self.status.is_terminal() {
            return Err(Error::State(format!(
                "deploy {} already finished as {}",
                self.id, self.status
            )));
        }
        self.status = status.into();
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
