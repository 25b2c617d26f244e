//! Work unit that runs a shell command in the job's working directory.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use shipyard_core::output::OutputSink;
use shipyard_core::source::SourceRepository;
use shipyard_core::{Reference, Result};

use crate::execution::{JobExecution, WorkUnit};

/// Runs `sh -c <command>`, streaming stdout and stderr into the job output.
/// The child is killed if the execution is cancelled.
pub struct CommandWorkUnit {
    command: String,
    env: BTreeMap<String, String>,
    checkout: Option<(Arc<dyn SourceRepository>, Reference)>,
}

impl CommandWorkUnit {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            checkout: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Check out `reference` into the working directory before running.
    pub fn with_checkout(mut self, source: Arc<dyn SourceRepository>, reference: Reference) -> Self {
        self.checkout = Some((source, reference));
        self
    }
}

#[async_trait]
impl WorkUnit for CommandWorkUnit {
    async fn run(&self, execution: &JobExecution, dir: &Path) -> Result<bool> {
        if let Some((source, reference)) = &self.checkout {
            execution.write(&format!("Checking out {}\n", reference));
            source.checkout(reference, dir).await?;
        }

        execution.write(&format!("$ {}\n", self.command));
        debug!(command = %self.command, dir = %dir.display(), "Spawning command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, _, status) = tokio::join!(
            pump(stdout, execution),
            pump(stderr, execution),
            child.wait()
        );
        let status = status?;

        match status.code() {
            Some(code) => execution.write(&format!("Exited with status {}\n", code)),
            None => execution.write("Terminated by signal\n"),
        }
        info!(command = %self.command, success = status.success(), "Command finished");

        Ok(status.success())
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, execution: &JobExecution) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        execution.write(&format!("{}\n", line));
    }
}
