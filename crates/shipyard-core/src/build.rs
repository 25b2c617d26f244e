//! Image builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BuildId, JobId, ProjectId};
use crate::project::Reference;

/// A container image build of a project at a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project_id: ProjectId,
    /// Human label; parameterized into the image tag when no explicit name is given.
    pub label: Option<String>,
    pub git_ref: Reference,
    /// Resolved commit written into the REVISION file.
    pub git_sha: String,
    pub dockerfile: String,
    /// Build through the cluster executor instead of the local image tool.
    pub cluster_build: bool,
    pub docker_build_job_id: Option<JobId>,
    /// Local image id of the last successful build.
    pub docker_image_id: Option<String>,
    /// Tag the image was pushed under.
    pub docker_ref: Option<String>,
    /// `<repository>@sha256:<hex>` of the image pushed in the current attempt.
    pub docker_repo_digest: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn new(project_id: ProjectId, git_ref: Reference, git_sha: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: BuildId::new(),
            project_id,
            label: None,
            git_ref,
            git_sha: git_sha.into(),
            dockerfile: "Dockerfile".to_string(),
            cluster_build: false,
            docker_build_job_id: None,
            docker_image_id: None,
            docker_ref: None,
            docker_repo_digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
