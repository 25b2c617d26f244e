//! Stage file parsing: one project and its deploy stages.
//!
//! ```kdl
//! project "billing" repository="registry.example.com/billing" source="https://git.example.com/billing.git"
//! stage "staging" command="./deploy.sh staging" next="production" email=#true
//! stage "production" command="./deploy.sh production" production=#true
//! ```

use kdl::{KdlDocument, KdlNode};
use shipyard_core::pipeline::PipelineGraph;
use shipyard_core::{Project, Stage, StageId};
use std::collections::HashMap;
use std::path::Path;

use crate::nodes::{bool_prop, first_string_arg, string_list_prop, string_prop};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone)]
pub struct StageFile {
    pub project: Project,
    pub stages: Vec<Stage>,
}

impl StageFile {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Parse a stage file from KDL text. Next-stage names are resolved to ids and
/// the resulting pipeline is checked for cycles.
pub fn parse_stage_file(kdl: &str) -> ConfigResult<StageFile> {
    let doc: KdlDocument = kdl.parse()?;

    let mut project = None;
    let mut stage_nodes = Vec::new();
    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if project.is_some() {
                    return Err(ConfigError::Duplicate("project".to_string()));
                }
                project = Some(parse_project(node)?);
            }
            "stage" => stage_nodes.push(node),
            _ => {}
        }
    }
    let project =
        project.ok_or_else(|| ConfigError::MissingField("project".to_string()))?;

    let mut stages = Vec::with_capacity(stage_nodes.len());
    let mut next_names = Vec::with_capacity(stage_nodes.len());
    for node in &stage_nodes {
        let stage = parse_stage(node, &project)?;
        if stages.iter().any(|s: &Stage| s.name == stage.name) {
            return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
        }
        next_names.push(string_list_prop(node, "next"));
        stages.push(stage);
    }

    let ids: HashMap<String, StageId> = stages.iter().map(|s| (s.name.clone(), s.id)).collect();
    for (stage, names) in stages.iter_mut().zip(next_names) {
        for name in names {
            if name.is_empty() {
                continue;
            }
            let id = ids.get(&name).ok_or_else(|| {
                ConfigError::InvalidReference(format!(
                    "stage '{}' triggers unknown stage '{}'",
                    stage.name, name
                ))
            })?;
            stage.next_stage_ids.push(Some(*id));
        }
    }

    let graph = PipelineGraph::new(&stages);
    let mut errors = Vec::new();
    for stage in &stages {
        graph.validate(stage, &mut errors);
    }
    if !errors.is_empty() {
        return Err(ConfigError::CycleDetected(errors.join("; ")));
    }

    Ok(StageFile { project, stages })
}

/// Read and parse a stage file.
pub fn load_stage_file(path: impl AsRef<Path>) -> ConfigResult<StageFile> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_stage_file(&content)
}

fn parse_project(node: &KdlNode) -> ConfigResult<Project> {
    let permalink = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
    let docker_repository = string_prop(node, "repository").unwrap_or_else(|| permalink.clone());
    let source = string_prop(node, "source").unwrap_or_default();
    Ok(Project::new(permalink, source, docker_repository))
}

fn parse_stage(node: &KdlNode, project: &Project) -> ConfigResult<Stage> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;
    let command = string_prop(node, "command").unwrap_or_default();

    let mut stage = Stage::new(project.id, name, command);
    stage.production = bool_prop(node, "production")?.unwrap_or(false);
    stage.no_code_deployed = bool_prop(node, "no-code-deployed")?.unwrap_or(false);
    stage.skip_buddy_check = bool_prop(node, "skip-buddy-check")?.unwrap_or(false);
    stage.send_email_notifications = bool_prop(node, "email")?.unwrap_or(false);
    stage.chat_notifications = bool_prop(node, "chat")?.unwrap_or(false);
    stage.update_commit_status = bool_prop(node, "commit-status")?.unwrap_or(false);
    stage.use_deployment_api = bool_prop(node, "deployment-api")?.unwrap_or(false);
    stage.metrics_tags = string_list_prop(node, "metrics-tags");
    Ok(stage)
}
