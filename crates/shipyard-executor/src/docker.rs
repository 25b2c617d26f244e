//! Local Docker image tool.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, PushImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{BuildInfo, PushImageInfo};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info};

use shipyard_core::image::{
    BuildOptions, ImageBuildTool, ProgressChunk, RegistryCredentials,
};
use shipyard_core::{Error, Result};

/// Image build/push tool backed by the local Docker daemon.
pub struct DockerImageTool {
    docker: Docker,
}

impl DockerImageTool {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(tool_error)?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check the daemon is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(tool_error)?;
        Ok(())
    }
}

#[async_trait]
impl ImageBuildTool for DockerImageTool {
    fn build_from_context(
        &self,
        context: Bytes,
        options: &BuildOptions,
    ) -> BoxStream<'static, Result<Bytes>> {
        let build_options = BuildImageOptions {
            dockerfile: options.dockerfile.clone(),
            t: options.tag.clone().unwrap_or_default(),
            buildargs: options.build_args.clone(),
            nocache: options.no_cache,
            rm: true,
            ..Default::default()
        };
        info!(dockerfile = %options.dockerfile, context_bytes = context.len(), "Building image");

        // bollard's build stream borrows the client; drive it from a task that
        // owns a clone so the returned stream can be 'static.
        let docker = self.docker.clone();
        futures::stream::once(async move {
            let (mut tx, rx) = futures::channel::mpsc::channel(1);
            tokio::spawn(async move {
                use futures::SinkExt;
                let mut stream = docker.build_image(build_options, None, Some(context));
                while let Some(item) = stream.next().await {
                    let chunk = item
                        .map_err(tool_error)
                        .and_then(|info| encode(&build_chunk(info)));
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            rx
        })
        .flatten()
        .boxed()
    }

    async fn tag(&self, image_id: &str, repository: &str, tag: &str) -> Result<()> {
        debug!(image_id, repository, tag, "Tagging image");
        let options = TagImageOptions {
            repo: repository.to_string(),
            tag: tag.to_string(),
        };
        self.docker
            .tag_image(image_id, Some(options))
            .await
            .map_err(tool_error)
    }

    fn push(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> BoxStream<'static, Result<Bytes>> {
        info!(repository, tag, "Pushing image");
        let options = PushImageOptions {
            tag: tag.to_string(),
        };
        self.docker
            .push_image(repository, Some(options), credentials.map(docker_credentials))
            .map(|item| item.map_err(tool_error).and_then(|info| encode(&push_chunk(info))))
            .boxed()
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        debug!(image_id, "Removing image");
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        self.docker
            .remove_image(image_id, Some(options), None)
            .await
            .map_err(tool_error)?;
        Ok(())
    }
}

fn docker_credentials(credentials: &RegistryCredentials) -> DockerCredentials {
    DockerCredentials {
        username: Some(credentials.username.clone()),
        password: Some(credentials.password.clone()),
        email: credentials.email.clone(),
        serveraddress: Some(credentials.server_address.clone()),
        ..Default::default()
    }
}

fn build_chunk(info: BuildInfo) -> ProgressChunk {
    ProgressChunk {
        id: info.id,
        stream: info.stream,
        status: info.status,
        progress: info.progress,
        error: info.error,
        aux: info
            .aux
            .and_then(|image| image.id)
            .map(|id| serde_json::json!({ "ID": id })),
    }
}

fn push_chunk(info: PushImageInfo) -> ProgressChunk {
    ProgressChunk {
        status: info.status,
        progress: info.progress,
        error: info.error,
        ..Default::default()
    }
}

/// Re-encode a decoded progress message as the raw JSON chunk the rest of the
/// pipeline consumes.
fn encode(chunk: &ProgressChunk) -> Result<Bytes> {
    serde_json::to_vec(chunk)
        .map(Bytes::from)
        .map_err(|e| Error::UnexpectedResponse(e.to_string()))
}

fn tool_error(error: DockerError) -> Error {
    match error {
        DockerError::JsonDataError { message, .. } => Error::UnexpectedResponse(message),
        DockerError::JsonSerdeError { err } => Error::UnexpectedResponse(err.to_string()),
        other => Error::BuildTool(other.to_string()),
    }
}
