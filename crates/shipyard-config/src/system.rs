//! System configuration parsing.

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use shipyard_core::image::RegistryCredentials;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::nodes::{bool_prop, string_prop, u64_prop};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Registry login used for pushes. `None` means anonymous access.
    pub registry: Option<RegistryCredentials>,
    pub builder: BuilderConfig,
    pub executor: ExecutorConfig,
    pub buddy_check: BuddyCheckConfig,
    pub cluster: Option<ClusterConfig>,
}

/// How the build context tarball is produced relative to the serving process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Child `tar` process.
    #[default]
    Process,
    /// Blocking thread pool.
    Thread,
    /// On the calling task.
    Inline,
}

impl std::str::FromStr for IsolationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            "inline" => Ok(Self::Inline),
            other => Err(ConfigError::InvalidValue {
                field: "builder.isolation".to_string(),
                message: format!("unknown isolation strategy: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Keep images in the local daemon after a build.
    pub keep_built_images: bool,
    pub isolation: IsolationStrategy,
    /// Test configuration: packaging always runs inline.
    pub test_mode: bool,
}

impl BuilderConfig {
    /// The strategy actually used for packaging.
    pub fn effective_isolation(&self) -> IsolationStrategy {
        if self.test_mode {
            IsolationStrategy::Inline
        } else {
            self.isolation
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of executions that may run at once.
    pub workers: usize,
    /// Parent directory for per-job working directories; system temp if unset.
    pub work_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            work_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuddyCheckConfig {
    pub enabled: bool,
    /// How long a buddy approval lets the same operator redeploy unattended.
    pub grace_period: Duration,
}

impl Default for BuddyCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_period: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Image of the in-cluster builder.
    pub builder_image: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "shipyard".to_string(),
            builder_image: "gcr.io/kaniko-project/executor:debug".to_string(),
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "registry" => {
                let server_address = string_prop(node, "server").ok_or_else(|| {
                    ConfigError::MissingField("registry server".to_string())
                })?;
                config.registry = Some(RegistryCredentials {
                    username: string_prop(node, "username").unwrap_or_default(),
                    password: string_prop(node, "password").unwrap_or_default(),
                    email: string_prop(node, "email"),
                    server_address,
                });
            }
            "builder" => {
                if let Some(keep) = bool_prop(node, "keep-images")? {
                    config.builder.keep_built_images = keep;
                }
                if let Some(isolation) = string_prop(node, "isolation") {
                    config.builder.isolation = isolation.parse()?;
                }
                if let Some(test_mode) = bool_prop(node, "test-mode")? {
                    config.builder.test_mode = test_mode;
                }
            }
            "executor" => {
                if let Some(workers) = u64_prop(node, "workers")? {
                    if workers == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "executor.workers".to_string(),
                            message: "must be at least 1".to_string(),
                        });
                    }
                    config.executor.workers = workers as usize;
                }
                config.executor.work_root = string_prop(node, "work-root").map(PathBuf::from);
            }
            "buddy-check" => {
                if let Some(enabled) = bool_prop(node, "enabled")? {
                    config.buddy_check.enabled = enabled;
                }
                if let Some(minutes) = u64_prop(node, "grace-period-minutes")? {
                    let secs = minutes.checked_mul(60).ok_or_else(|| ConfigError::InvalidValue {
                        field: "buddy-check.grace-period-minutes".to_string(),
                        message: format!("{} minutes is out of range", minutes),
                    })?;
                    config.buddy_check.grace_period = Duration::from_secs(secs);
                }
            }
            "cluster" => {
                let mut cluster = ClusterConfig::default();
                if let Some(namespace) = string_prop(node, "namespace") {
                    cluster.namespace = namespace;
                }
                if let Some(image) = string_prop(node, "image") {
                    cluster.builder_image = image;
                }
                config.cluster = Some(cluster);
            }
            other => {
                tracing::warn!(node = %other, "Ignoring unknown configuration node");
            }
        }
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_system_config(&content)
}

impl SystemConfig {
    /// Apply `SHIPYARD_*` overrides from the given lookup (normally the
    /// process environment).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let server = lookup("SHIPYARD_REGISTRY_SERVER");
        let username = lookup("SHIPYARD_REGISTRY_USERNAME");
        let password = lookup("SHIPYARD_REGISTRY_PASSWORD");
        let email = lookup("SHIPYARD_REGISTRY_EMAIL");

        if let Some(server_address) = server.clone() {
            self.registry.get_or_insert_with(|| RegistryCredentials {
                username: String::new(),
                password: String::new(),
                email: None,
                server_address,
            });
        }
        if let Some(registry) = self.registry.as_mut() {
            if let Some(server) = server {
                registry.server_address = server;
            }
            if let Some(username) = username {
                registry.username = username;
            }
            if let Some(password) = password {
                registry.password = password;
            }
            if email.is_some() {
                registry.email = email;
            }
        }

        if let Some(test_mode) = lookup("SHIPYARD_TEST_MODE") {
            self.builder.test_mode = matches!(test_mode.as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Apply overrides from the process environment.
    pub fn from_env_overrides(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }
}
