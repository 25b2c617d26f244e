//! Packaging a working directory into a build context archive.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use shipyard_config::IsolationStrategy;
use shipyard_core::{Error, Result};

/// Package `dir` as an uncompressed tar archive.
///
/// `Process` shells out to `tar`, `Thread` archives on the blocking pool and
/// `Inline` archives on the calling task.
pub async fn package(dir: &Path, isolation: IsolationStrategy) -> Result<Bytes> {
    debug!(dir = %dir.display(), ?isolation, "Packaging build context");
    match isolation {
        IsolationStrategy::Process => package_with_tar_binary(dir).await,
        IsolationStrategy::Thread => {
            let dir: PathBuf = dir.to_path_buf();
            tokio::task::spawn_blocking(move || archive(&dir))
                .await
                .map_err(|e| Error::Internal(format!("packaging task failed: {}", e)))?
        }
        IsolationStrategy::Inline => archive(dir),
    }
}

fn archive(dir: &Path) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all("", dir)?;
    Ok(Bytes::from(builder.into_inner()?))
}

async fn package_with_tar_binary(dir: &Path) -> Result<Bytes> {
    let output = Command::new("tar")
        .arg("-cf")
        .arg("-")
        .arg("-C")
        .arg(dir)
        .arg(".")
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Execution(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(Bytes::from(output.stdout))
}
