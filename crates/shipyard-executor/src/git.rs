//! Source checkout: git remotes and local directories.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use shipyard_core::source::SourceRepository;
use shipyard_core::{Error, Reference, Result};

/// Checks out sources with the `git` command line client.
pub struct GitSourceRepository {
    url: String,
}

impl GitSourceRepository {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
    let mut command = Command::new("git");
    command.args(args).kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command.output().await?;
    if !output.status.success() {
        return Err(Error::Execution(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_full_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// First SHA in `git ls-remote` output.
fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|sha| is_full_sha(sha))
        .map(str::to_string)
}

#[async_trait]
impl SourceRepository for GitSourceRepository {
    async fn checkout(&self, reference: &Reference, dir: &Path) -> Result<()> {
        let target = dir.to_string_lossy();
        info!(url = %self.url, reference = %reference, "Cloning repository");
        git(&["clone", "--quiet", "--", &self.url, &target], None).await?;
        git(&["checkout", "--quiet", reference.as_str()], Some(dir)).await?;
        Ok(())
    }

    async fn resolve(&self, reference: &Reference) -> Result<String> {
        if is_full_sha(reference.as_str()) {
            return Ok(reference.as_str().to_lowercase());
        }
        let output = git(&["ls-remote", &self.url, reference.as_str()], None).await?;
        parse_ls_remote(&output).ok_or_else(|| {
            Error::NotFound(format!("reference {} in {}", reference, self.url))
        })
    }
}

/// Copies a directory on disk as the checkout. The reference is recorded but
/// not interpreted.
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SourceRepository for LocalDirSource {
    async fn checkout(&self, reference: &Reference, dir: &Path) -> Result<()> {
        debug!(root = %self.root.display(), reference = %reference, "Copying local sources");
        let from = self.root.clone();
        let to = dir.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {}", e)))??;
        Ok(())
    }

    async fn resolve(&self, reference: &Reference) -> Result<String> {
        Ok(reference.as_str().to_string())
    }
}
