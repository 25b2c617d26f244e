//! Core domain types and collaborator traits for Shipyard.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Projects, stages, jobs, deploys and builds
//! - The stage pipeline graph
//! - Collaborator traits: store, notifiers, event bus, image tooling,
//!   output sink and source checkout

pub mod build;
pub mod deploy;
pub mod error;
pub mod events;
pub mod id;
pub mod image;
pub mod job;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod project;
pub mod source;
pub mod stage;
pub mod store;

pub use build::Build;
pub use deploy::{Deploy, DeployStatus};
pub use error::{Error, Result};
pub use id::{BuildId, DeployId, JobId, ProjectId, ResourceId, StageId, UserId};
pub use job::{Job, JobStatus};
pub use pipeline::PipelineGraph;
pub use project::{Project, Reference, User};
pub use stage::Stage;
pub use store::{MemoryStore, Store};
