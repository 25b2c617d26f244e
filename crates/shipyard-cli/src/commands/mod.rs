//! CLI command implementations.

pub mod build;
pub mod deploy;

use anyhow::{Context, Result};
use shipyard_config::{SystemConfig, load_stage_file, load_system_config};
use shipyard_core::{Job, PipelineGraph};
use shipyard_scheduler::ExecutionObserver;
use std::io::Write;
use std::path::Path;

/// Load the system configuration, or defaults when no file is given, then
/// apply environment overrides.
pub fn system_config(path: Option<&Path>) -> Result<SystemConfig> {
    let config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    Ok(config.from_env_overrides())
}

pub fn validate(path: &Path) -> Result<()> {
    let file = load_stage_file(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    let graph = PipelineGraph::new(&file.stages);
    println!("Project {}", file.project.permalink);
    for stage in &file.stages {
        let marker = if graph.is_effectively_production(stage) {
            " (production)"
        } else {
            ""
        };
        println!("  stage {}{}", stage.name, marker);
    }
    println!("Configuration is valid");
    Ok(())
}

/// Streams job output to stdout.
pub struct PrintObserver;

impl ExecutionObserver for PrintObserver {
    fn on_output(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn on_finished(&self, job: &Job) {
        println!("--- Job {} {} ---", job.id, job.status);
    }
}
