//! Stages: deploy targets within a project.

use serde::{Deserialize, Serialize};

use crate::id::{ProjectId, StageId};

/// A deploy target (e.g. "staging", "production") with its notification
/// settings and pipeline edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub project_id: ProjectId,
    pub name: String,
    /// Shell command run by a deploy of this stage.
    pub command: String,
    pub production: bool,
    /// Deploys to this stage do not ship code (e.g. config-only restarts).
    pub no_code_deployed: bool,
    /// Opt out of buddy checks even when the stage counts as production.
    pub skip_buddy_check: bool,
    pub send_email_notifications: bool,
    pub chat_notifications: bool,
    /// Tags attached to metrics events; the metrics channel is enabled when non-empty.
    pub metrics_tags: Vec<String>,
    pub update_commit_status: bool,
    pub use_deployment_api: bool,
    /// Stages triggered after a successful deploy. Entries may be empty and
    /// are compacted before use.
    pub next_stage_ids: Vec<Option<StageId>>,
}

impl Stage {
    pub fn new(project_id: ProjectId, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: StageId::new(),
            project_id,
            name: name.into(),
            command: command.into(),
            production: false,
            no_code_deployed: false,
            skip_buddy_check: false,
            send_email_notifications: false,
            chat_notifications: false,
            metrics_tags: Vec::new(),
            update_commit_status: false,
            use_deployment_api: false,
            next_stage_ids: Vec::new(),
        }
    }

    /// Next-stage edges with empty entries discarded.
    pub fn next_stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.next_stage_ids.iter().flatten().copied()
    }
}
