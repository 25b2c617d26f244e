//! Infrastructure backends for Shipyard.
//!
//! - `docker`: image build and push through the local Docker daemon
//! - `kubernetes`: cluster builds as Kubernetes batch jobs
//! - `tarball`: build context packaging
//! - `git`: source checkout

pub mod docker;
pub mod git;
pub mod kubernetes;
pub mod tarball;

pub use docker::DockerImageTool;
pub use git::{GitSourceRepository, LocalDirSource};
pub use kubernetes::{DIGEST_MARKER, KubernetesBuildExecutor};
pub use tarball::package;
