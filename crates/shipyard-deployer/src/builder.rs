//! Container image builds: package, build, push and digest bookkeeping.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{Instrument, error, info, info_span, warn};

use shipyard_config::{BuilderConfig, SystemConfig};
use shipyard_core::events::{BUILD_FINISHED, EventBus};
use shipyard_core::image::{
    BuildOptions, ClusterBuildExecutor, ClusterBuildSpec, ImageBuildTool, ProgressChunk,
    RegistryCredentials,
};
use shipyard_core::output::OutputSink;
use shipyard_core::source::SourceRepository;
use shipyard_core::{Build, BuildId, Error, Job, Result, Store};
use shipyard_executor::{DIGEST_MARKER, package};
use shipyard_scheduler::{JobExecution, JobExecutor, work_fn};

static PUSH_DIGEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)digest:\s*(sha256:[0-9a-f]{64})").unwrap());

static CLUSTER_DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"{}\s*(sha256:[0-9a-f]{{64}})",
        regex::escape(DIGEST_MARKER)
    ))
    .unwrap()
});

static SUCCESSFULLY_BUILT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Successfully built ([0-9a-f]+)").unwrap());

/// Explicit build configuration.
#[derive(Debug, Clone, Default)]
pub struct BuilderSettings {
    pub registry: Option<RegistryCredentials>,
    pub builder: BuilderConfig,
}

impl BuilderSettings {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            registry: config.registry.clone(),
            builder: config.builder.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Explicit tag; falls back to the parameterized build label, then `latest`.
    pub image_name: Option<String>,
    pub push: bool,
    pub tag_as_latest: bool,
}

/// Runs after every build job, whatever its outcome.
#[async_trait]
pub trait BuildHook: Send + Sync {
    async fn after_build(&self, build: &Build, job: &Job);
}

#[derive(Clone)]
struct Collaborators {
    store: Arc<dyn Store>,
    executor: Arc<JobExecutor>,
    image_tool: Arc<dyn ImageBuildTool>,
    source: Arc<dyn SourceRepository>,
    events: Arc<dyn EventBus>,
    cluster: Option<Arc<dyn ClusterBuildExecutor>>,
    hook: Option<Arc<dyn BuildHook>>,
    settings: BuilderSettings,
}

/// Builds project images as jobs on the executor.
#[derive(Clone)]
pub struct DockerBuilderService {
    inner: Arc<Collaborators>,
}

impl DockerBuilderService {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<JobExecutor>,
        image_tool: Arc<dyn ImageBuildTool>,
        source: Arc<dyn SourceRepository>,
        events: Arc<dyn EventBus>,
        settings: BuilderSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Collaborators {
                store,
                executor,
                image_tool,
                source,
                events,
                cluster: None,
                hook: None,
                settings,
            }),
        }
    }

    /// Use `cluster` for builds flagged as cluster builds.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterBuildExecutor>) -> Self {
        Arc::make_mut(&mut self.inner).cluster = Some(cluster);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BuildHook>) -> Self {
        Arc::make_mut(&mut self.inner).hook = Some(hook);
        self
    }

    /// Start a build job for `build_id`. Any still active job of the same
    /// build is cancelled first.
    pub async fn run(&self, build_id: BuildId, request: BuildRequest) -> Result<JobExecution> {
        let span = info_span!("build", build_id = %build_id, push = request.push);
        async move {
            let store = &self.inner.store;
            let mut build = store.get_build(build_id).await?;

            if let Some(previous) = build.docker_build_job_id {
                if self.inner.executor.cancel(previous) {
                    info!(job_id = %previous, "Cancelled previous build job");
                }
            }

            let job = Job::new(
                format!("docker build {}", build.git_ref),
                build.git_ref.clone(),
                None,
            );
            store.create_job(&job).await?;
            build.docker_build_job_id = Some(job.id);
            build.updated_at = Utc::now();
            store.save_build(&build).await?;

            let service = self.clone();
            let work = work_fn(move |execution: JobExecution, dir: PathBuf| {
                let service = service.clone();
                let request = request.clone();
                async move { service.execute(build_id, &request, &execution, &dir).await }
            });
            let execution = self
                .inner
                .executor
                .start(build.git_ref.clone(), job, work)
                .await?;

            let inner = self.inner.clone();
            execution
                .on_complete(move |job| async move { build_finished(inner, build_id, job).await })
                .await;

            Ok(execution)
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        build_id: BuildId,
        request: &BuildRequest,
        execution: &JobExecution,
        dir: &Path,
    ) -> Result<bool> {
        let mut build = self.inner.store.get_build(build_id).await?;

        if build.cluster_build {
            if let Some(cluster) = &self.inner.cluster {
                return self
                    .run_build_image_job(cluster.as_ref(), &mut build, request, execution)
                    .await;
            }
            warn!("Cluster build requested without a cluster executor, building locally");
        }

        build.docker_repo_digest = None;
        build.docker_ref = None;
        build.updated_at = Utc::now();
        self.inner.store.save_build(&build).await?;

        execution.write(&format!("Checking out {}\n", build.git_ref));
        self.inner.source.checkout(&build.git_ref, dir).await?;

        let Some(image_id) = self.build_image(&mut build, dir, execution).await? else {
            return Ok(false);
        };

        let mut success = true;
        if request.push {
            success = self
                .push_image(
                    &mut build,
                    request.image_name.as_deref(),
                    request.tag_as_latest,
                    execution,
                )
                .await?
                .is_some();
        }

        if !self.inner.settings.builder.keep_built_images {
            if let Err(e) = self.inner.image_tool.remove_image(&image_id).await {
                warn!(image_id = %image_id, error = %e, "Failed to remove built image");
            }
        }
        Ok(success)
    }

    /// Build the image for `build` from the checked-out tree in `dir`.
    ///
    /// Image tool faults are written to the output and yield `None`.
    pub async fn build_image(
        &self,
        build: &mut Build,
        dir: &Path,
        output: &dyn OutputSink,
    ) -> Result<Option<String>> {
        tokio::fs::write(dir.join("REVISION"), &build.git_sha).await?;

        let isolation = self.inner.settings.builder.effective_isolation();
        output.write("Packaging build context\n");
        let context = package(dir, isolation).await?;

        let options = BuildOptions {
            dockerfile: build.dockerfile.clone(),
            ..Default::default()
        };
        let stream = self.inner.image_tool.build_from_context(context, &options);

        build.docker_image_id = None;
        let result = match consume(stream, output, image_id_from).await {
            Ok(Some(image_id)) => Ok(Some(image_id)),
            Ok(None) => Err(Error::BuildTool(
                "build finished without reporting an image id".to_string(),
            )),
            Err(e) => Err(e),
        };

        let image_id = match result {
            Ok(image_id) => image_id,
            Err(e) if e.is_build_tool_fault() => {
                error!(build_id = %build.id, error = %e, "Image build failed");
                output.write(&format!("Docker build failed: {}\n", e));
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(id) = &image_id {
            info!(build_id = %build.id, image_id = %id, "Image built");
            build.docker_image_id = Some(id.clone());
        }
        build.updated_at = Utc::now();
        self.inner.store.save_build(build).await?;
        Ok(image_id)
    }

    /// Tag and push the built image, recording the repository digest the
    /// registry reports. With `tag_as_latest`, `latest` is pushed too.
    ///
    /// Image tool faults, including a push that never reports a digest, are
    /// written to the output and yield `None` with the digest left unset.
    pub async fn push_image(
        &self,
        build: &mut Build,
        image_name: Option<&str>,
        tag_as_latest: bool,
        output: &dyn OutputSink,
    ) -> Result<Option<Build>> {
        let image_id = build
            .docker_image_id
            .clone()
            .ok_or_else(|| Error::State(format!("build {} has no image to push", build.id)))?;
        let project = self.inner.store.get_project(build.project_id).await?;
        let repository = project.docker_repository;
        let tag = image_tag(image_name, build.label.as_deref());

        let span = info_span!("push", build_id = %build.id, repository = %repository, tag = %tag);
        async move {
            build.docker_repo_digest = None;
            build.docker_ref = None;
            build.updated_at = Utc::now();
            self.inner.store.save_build(build).await?;

            let pushed = self
                .push_tags(&image_id, &repository, &tag, tag_as_latest, output)
                .await;

            let result = match pushed {
                Ok(digest) => {
                    info!(digest = %digest, "Image pushed");
                    build.docker_ref = Some(tag.clone());
                    build.docker_repo_digest = Some(format!("{}@{}", repository, digest));
                    Ok(true)
                }
                Err(e) if e.is_build_tool_fault() => {
                    error!(error = %e, "Image push failed");
                    output.write(&format!("Docker push failed: {}\n", e));
                    Ok(false)
                }
                Err(e) => Err(e),
            };

            build.updated_at = Utc::now();
            self.inner.store.save_build(build).await?;
            Ok(result?.then(|| build.clone()))
        }
        .instrument(span)
        .await
    }

    async fn push_tags(
        &self,
        image_id: &str,
        repository: &str,
        tag: &str,
        tag_as_latest: bool,
        output: &dyn OutputSink,
    ) -> Result<String> {
        let digest = self.push_tag(image_id, repository, tag, output).await?;
        if tag_as_latest && tag != "latest" {
            self.push_tag(image_id, repository, "latest", output).await?;
        }
        Ok(digest)
    }

    async fn push_tag(
        &self,
        image_id: &str,
        repository: &str,
        tag: &str,
        output: &dyn OutputSink,
    ) -> Result<String> {
        let tool = &self.inner.image_tool;
        tool.tag(image_id, repository, tag).await?;
        output.write(&format!("Pushing {}:{}\n", repository, tag));

        let stream = tool.push(repository, tag, self.inner.settings.registry.as_ref());
        consume(stream, output, digest_from)
            .await?
            .ok_or_else(|| Error::MissingDigest(format!("{}:{}", repository, tag)))
    }

    /// Build through the cluster executor and pick the digest out of its log.
    pub async fn run_build_image_job(
        &self,
        cluster: &dyn ClusterBuildExecutor,
        build: &mut Build,
        request: &BuildRequest,
        execution: &JobExecution,
    ) -> Result<bool> {
        build.docker_repo_digest = None;
        build.updated_at = Utc::now();
        self.inner.store.save_build(build).await?;

        let project = self.inner.store.get_project(build.project_id).await?;
        let tag = image_tag(request.image_name.as_deref(), build.label.as_deref());
        let spec = ClusterBuildSpec {
            build_id: build.id,
            job_id: execution.job_id(),
            repository_url: project.repository_url.clone(),
            git_sha: build.git_sha.clone(),
            dockerfile: build.dockerfile.clone(),
            destination: format!("{}:{}", project.docker_repository, tag),
            push: request.push,
        };

        execution.write(&format!("Starting cluster build of {}\n", spec.destination));
        let outcome = match cluster.execute(&spec).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_build_tool_fault() => {
                error!(error = %e, "Cluster build failed");
                execution.write(&format!("Cluster build failed: {}\n", e));
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        execution.write(&outcome.log);

        if outcome.success {
            match cluster_digest(&outcome.log) {
                Some(digest) => {
                    build.docker_ref = Some(tag);
                    build.docker_repo_digest =
                        Some(format!("{}@{}", project.docker_repository, digest));
                }
                None => execution.write("Unable to find the image digest in the build log\n"),
            }
            build.updated_at = Utc::now();
            self.inner.store.save_build(build).await?;
        }
        Ok(outcome.success)
    }
}

async fn build_finished(inner: Arc<Collaborators>, build_id: BuildId, job: Job) {
    let build = match inner.store.get_build(build_id).await {
        Ok(build) => build,
        Err(e) => {
            error!(build_id = %build_id, error = %e, "Failed to load finished build");
            return;
        }
    };

    inner.events.publish(
        BUILD_FINISHED,
        serde_json::json!({
            "build_id": build.id,
            "job_id": job.id,
            "status": job.status,
            "docker_ref": build.docker_ref,
            "docker_repo_digest": build.docker_repo_digest,
        }),
    );
    if let Some(hook) = &inner.hook {
        hook.after_build(&build, &job).await;
    }
}

/// Drain a progress stream into `output`, returning the last value `extract`
/// found. A chunk carrying an error ends the stream as a build tool fault.
async fn consume(
    mut stream: BoxStream<'static, Result<Bytes>>,
    output: &dyn OutputSink,
    extract: fn(&ProgressChunk) -> Option<String>,
) -> Result<Option<String>> {
    let mut found = None;
    while let Some(raw) = stream.next().await {
        for chunk in output.write_chunk(&raw?) {
            if let Some(message) = chunk.error {
                return Err(Error::BuildTool(message));
            }
            if let Some(value) = extract(&chunk) {
                found = Some(value);
            }
        }
    }
    Ok(found)
}

fn image_id_from(chunk: &ProgressChunk) -> Option<String> {
    if let Some(id) = chunk
        .aux
        .as_ref()
        .and_then(|aux| aux.get("ID"))
        .and_then(|id| id.as_str())
    {
        return Some(id.to_string());
    }
    let stream = chunk.stream.as_deref()?;
    SUCCESSFULLY_BUILT
        .captures(stream)
        .map(|caps| caps[1].to_string())
}

fn digest_from(chunk: &ProgressChunk) -> Option<String> {
    if let Some(digest) = chunk
        .aux
        .as_ref()
        .and_then(|aux| aux.get("Digest"))
        .and_then(|d| d.as_str())
        .filter(|d| d.starts_with("sha256:"))
    {
        return Some(digest.to_lowercase());
    }
    let status = chunk.status.as_deref()?;
    PUSH_DIGEST
        .captures(status)
        .map(|caps| caps[1].to_lowercase())
}

fn cluster_digest(log: &str) -> Option<String> {
    CLUSTER_DIGEST
        .captures_iter(log)
        .last()
        .map(|caps| caps[1].to_string())
}

/// Tag for an image: the explicit name, else the label parameterized, else
/// `latest`.
pub fn image_tag(image_name: Option<&str>, label: Option<&str>) -> String {
    if let Some(name) = image_name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    label
        .map(parameterize)
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "latest".to_string())
}

fn parameterize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
