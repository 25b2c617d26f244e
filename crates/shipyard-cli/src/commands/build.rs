//! Local image build command.

use anyhow::{Context, Result, bail};
use shipyard_config::SystemConfig;
use shipyard_core::events::BroadcastEventBus;
use shipyard_core::source::SourceRepository;
use shipyard_core::{Build, JobStatus, MemoryStore, Project, Reference, Store};
use shipyard_deployer::{BuildRequest, BuilderSettings, DockerBuilderService};
use shipyard_executor::{DockerImageTool, LocalDirSource};
use shipyard_scheduler::JobExecutor;
use std::path::PathBuf;
use std::sync::Arc;

use super::PrintObserver;

pub struct BuildArgs {
    pub dir: PathBuf,
    pub repository: String,
    pub image: Option<String>,
    pub label: Option<String>,
    pub reference: String,
    pub dockerfile: String,
    pub push: bool,
    pub latest: bool,
}

/// Build (and optionally push) the image for a local source directory.
pub async fn run(config: SystemConfig, args: BuildArgs) -> Result<()> {
    let dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", args.dir.display()))?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let tool = DockerImageTool::new().context("Failed to connect to Docker")?;
    tool.ping().await.context("Docker is not reachable")?;

    let store = Arc::new(MemoryStore::new());
    let project = Project::new(name, "", args.repository);
    store.save_project(&project).await?;

    let source = Arc::new(LocalDirSource::new(&dir));
    let reference = Reference::parse(args.reference)?;
    let sha = source.resolve(&reference).await?;
    let mut build = Build::new(project.id, reference, sha);
    build.dockerfile = args.dockerfile;
    build.label = args.label;
    store.save_build(&build).await?;

    let executor = Arc::new(JobExecutor::new(&config.executor, store.clone()));
    let service = DockerBuilderService::new(
        store.clone(),
        executor,
        Arc::new(tool),
        source,
        Arc::new(BroadcastEventBus::default()),
        BuilderSettings::from_system(&config),
    );

    let request = BuildRequest {
        image_name: args.image,
        push: args.push,
        tag_as_latest: args.latest,
    };
    let execution = service.run(build.id, request).await?;
    execution.subscribe(Arc::new(PrintObserver));
    let job = execution.wait().await;

    let build = store.get_build(build.id).await?;
    if job.status != JobStatus::Succeeded {
        bail!("Build {} {}", build.id, job.status);
    }
    if let Some(image) = &build.docker_image_id {
        println!("Built {}", image);
    }
    if let Some(digest) = &build.docker_repo_digest {
        println!("Pushed {}", digest);
    }
    Ok(())
}
