//! Kubernetes cluster build executor.
//!
//! Runs the image builder as a batch `Job`, waits for it, collects the pod
//! logs and removes the job.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use shipyard_config::ClusterConfig;
use shipyard_core::image::{ClusterBuildExecutor, ClusterBuildOutcome, ClusterBuildSpec};
use shipyard_core::{Error, Result};

/// Line the builder prints once the image digest is known.
pub const DIGEST_MARKER: &str = "BUILD DIGEST:";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cluster build executor backed by Kubernetes batch jobs.
pub struct KubernetesBuildExecutor {
    client: Client,
    config: ClusterConfig,
    poll_interval: Duration,
}

impl KubernetesBuildExecutor {
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: ClusterConfig) -> Self {
        Self {
            client,
            config,
            poll_interval: POLL_INTERVAL,
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn wait_for_completion(&self, name: &str) -> Result<bool> {
        let jobs = self.jobs();
        loop {
            let job = jobs.get(name).await.map_err(cluster_error)?;
            let status = job.status.unwrap_or_default();
            if status.succeeded.unwrap_or(0) > 0 {
                return Ok(true);
            }
            if status.failed.unwrap_or(0) > 0 {
                return Ok(false);
            }
            debug!(job = %name, "Build job still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn collect_logs(&self, name: &str) -> Result<String> {
        let pods = self.pods();
        let selector = format!("job-name={}", name);
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(cluster_error)?;

        let mut log = String::new();
        for pod in list.items {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            match pods.logs(&pod_name, &LogParams::default()).await {
                Ok(text) => log.push_str(&text),
                Err(e) => warn!(pod = %pod_name, error = %e, "Failed to read build pod logs"),
            }
        }
        Ok(log)
    }

    async fn cleanup(&self, name: &str) {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        if let Err(e) = self.jobs().delete(name, &params).await {
            warn!(job = %name, error = %e, "Failed to delete build job");
        }
    }
}

#[async_trait]
impl ClusterBuildExecutor for KubernetesBuildExecutor {
    async fn execute(&self, spec: &ClusterBuildSpec) -> Result<ClusterBuildOutcome> {
        let manifest = build_job(spec, &self.config);
        let name = job_name(spec);

        info!(job = %name, destination = %spec.destination, "Creating cluster build job");
        self.jobs()
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(cluster_error)?;

        let result = self.wait_for_completion(&name).await;
        let log = self.collect_logs(&name).await.unwrap_or_else(|e| {
            warn!(job = %name, error = %e, "Failed to list build pods");
            String::new()
        });
        self.cleanup(&name).await;

        let success = result?;
        info!(job = %name, success, "Cluster build job finished");
        Ok(ClusterBuildOutcome { success, log })
    }
}

fn cluster_error(error: kube::Error) -> Error {
    Error::BuildTool(format!("cluster: {}", error))
}

fn job_name(spec: &ClusterBuildSpec) -> String {
    format!("shipyard-build-{}", spec.job_id)
}

/// Builder context URL for a repository at a commit.
fn git_context(repository_url: &str, sha: &str) -> String {
    let bare = repository_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git://");
    format!("git://{}#{}", bare, sha)
}

fn builder_script(spec: &ClusterBuildSpec) -> String {
    let mut args = vec![
        format!("--context={}", git_context(&spec.repository_url, &spec.git_sha)),
        format!("--dockerfile={}", spec.dockerfile),
        format!("--destination={}", spec.destination),
        "--digest-file=/tmp/digest".to_string(),
    ];
    if !spec.push {
        args.push("--no-push".to_string());
    }
    format!(
        "/kaniko/executor {} && echo \"{} $(cat /tmp/digest)\"",
        args.join(" "),
        DIGEST_MARKER
    )
}

fn build_job(spec: &ClusterBuildSpec, config: &ClusterConfig) -> Job {
    let labels = BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), "shipyard".to_string()),
        ("shipyard/build-id".to_string(), spec.build_id.to_string()),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(spec)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "builder".to_string(),
                        image: Some(config.builder_image.clone()),
                        command: Some(vec!["/busybox/sh".to_string(), "-c".to_string()]),
                        args: Some(vec![builder_script(spec)]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
