//! Projects, source references and operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ProjectId, UserId};
use crate::{Error, Result};

/// A deployable project. Owns stages and builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Unique key, e.g. "billing".
    pub permalink: String,
    pub name: String,
    /// Source repository URL.
    pub repository_url: String,
    /// Image repository builds are pushed to, e.g. "registry.example.com/billing".
    pub docker_repository: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        permalink: impl Into<String>,
        repository_url: impl Into<String>,
        docker_repository: impl Into<String>,
    ) -> Self {
        let permalink = permalink.into();
        Self {
            id: ProjectId::new(),
            name: permalink.clone(),
            permalink,
            repository_url: repository_url.into(),
            docker_repository: docker_repository.into(),
            created_at: Utc::now(),
        }
    }
}

/// Opaque identifier for source code state: a commit SHA, branch or tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference(String);

impl Reference {
    /// Validate and capture a reference.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("reference must not be empty".to_string()));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::Validation(format!(
                "reference '{}' contains whitespace or control characters",
                trimmed
            )));
        }
        // Refs are handed to git as positional arguments.
        if trimmed.starts_with('-') {
            return Err(Error::Validation(format!(
                "reference '{}' must not start with '-'",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Reference {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.0
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An operator interacting with deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            email: None,
        }
    }
}
