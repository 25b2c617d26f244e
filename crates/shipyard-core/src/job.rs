//! Jobs: units of executable work and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, UserId};
use crate::project::Reference;
use crate::{Error, Result};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// Anticipated negative outcome (non-zero exit, failed build).
    Failed,
    /// Unanticipated fault inside the work.
    Errored,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Errored | JobStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled | JobStatus::Errored
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Errored => "errored",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command plus its execution status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub reference: Reference,
    pub user_id: Option<UserId>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(command: impl Into<String>, reference: Reference, user_id: Option<UserId>) -> Self {
        Self {
            id: JobId::new(),
            command: command.into(),
            reference,
            user_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job to `next`, stamping timestamps. Backward or post-terminal
    /// moves are rejected.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::State(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("./deploy.sh", Reference::parse("main").unwrap(), None)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.finished_at.is_some());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_status_is_final() {
        for terminal in [
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Errored,
            JobStatus::Cancelled,
        ] {
            let mut job = job();
            job.transition(JobStatus::Running).unwrap();
            job.transition(terminal).unwrap();
            for next in [JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded] {
                assert!(matches!(job.transition(next), Err(Error::State(_))));
            }
            assert_eq!(job.status, terminal);
        }
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_finished() {
        let mut job = job();
        assert!(job.clone().transition(JobStatus::Succeeded).is_err());
        job.transition(JobStatus::Cancelled).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.transition(JobStatus::Pending).is_err());
    }
}
