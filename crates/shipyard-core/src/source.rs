//! Source checkout collaborator.

use async_trait::async_trait;
use std::path::Path;

use crate::Result;
use crate::project::Reference;

/// Materializes source code at a reference into a working directory.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn checkout(&self, reference: &Reference, dir: &Path) -> Result<()>;

    /// Resolve a reference to a full commit SHA.
    async fn resolve(&self, reference: &Reference) -> Result<String>;
}
