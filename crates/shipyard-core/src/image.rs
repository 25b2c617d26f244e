//! Image build collaborators: the local build/push tool, the cluster build
//! executor, registry credentials and streamed progress chunks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;
use crate::id::{BuildId, JobId};

/// Registry login. Absent credentials mean anonymous registry access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub server_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Dockerfile path inside the context.
    pub dockerfile: String,
    /// Optional `repo:tag` applied by the build itself.
    pub tag: Option<String>,
    pub build_args: HashMap<String, String>,
    pub no_cache: bool,
}

/// Local image build/push tool. Streams yield raw JSON progress chunks as
/// the tool emits them; faults are `Error::BuildTool` or
/// `Error::UnexpectedResponse`.
#[async_trait]
pub trait ImageBuildTool: Send + Sync {
    fn build_from_context(
        &self,
        context: Bytes,
        options: &BuildOptions,
    ) -> BoxStream<'static, Result<Bytes>>;

    async fn tag(&self, image_id: &str, repository: &str, tag: &str) -> Result<()>;

    fn push(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> BoxStream<'static, Result<Bytes>>;

    async fn remove_image(&self, image_id: &str) -> Result<()>;
}

/// Input for an out-of-process cluster build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBuildSpec {
    pub build_id: BuildId,
    pub job_id: JobId,
    pub repository_url: String,
    pub git_sha: String,
    pub dockerfile: String,
    /// Destination `repository:tag`.
    pub destination: String,
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBuildOutcome {
    pub success: bool,
    pub log: String,
}

#[async_trait]
pub trait ClusterBuildExecutor: Send + Sync {
    async fn execute(&self, spec: &ClusterBuildSpec) -> Result<ClusterBuildOutcome>;
}

/// One JSON object from a build or push progress stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
}

impl ProgressChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            stream: Some(text.into()),
            ..Default::default()
        }
    }

    /// Human readable line for the job output, if the chunk carries one.
    pub fn display_text(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(format!("ERROR: {}\n", error.trim_end()));
        }
        if let Some(stream) = &self.stream {
            return Some(stream.clone());
        }
        let status = self.status.as_ref()?;
        let mut line = match &self.id {
            Some(id) => format!("{}: {}", id, status),
            None => status.clone(),
        };
        if let Some(progress) = &self.progress {
            line.push(' ');
            line.push_str(progress);
        }
        line.push('\n');
        Some(line)
    }
}

/// Parse a raw progress payload. Tools send concatenated or newline-separated
/// JSON objects; anything that does not parse is kept as plain text.
pub fn parse_progress(raw: &[u8]) -> Vec<ProgressChunk> {
    let mut chunks = Vec::new();
    let mut objects = serde_json::Deserializer::from_slice(raw).into_iter::<ProgressChunk>();
    loop {
        match objects.next() {
            Some(Ok(chunk)) => chunks.push(chunk),
            Some(Err(_)) => {
                let rest = raw.get(objects.byte_offset()..).unwrap_or_default();
                let text = String::from_utf8_lossy(rest);
                if !text.trim().is_empty() {
                    chunks.push(ProgressChunk::text(text.into_owned()));
                }
                break;
            }
            None => break,
        }
    }
    chunks
}
