//! Deploy and image build services for Shipyard.
//!
//! - [`DeployService`] turns deploy requests into jobs, enforcing the buddy
//!   check on production stages and fanning out notifications.
//! - [`DockerBuilderService`] builds, pushes and records digests for project
//!   images, locally or through a cluster executor.

pub mod builder;
pub mod notifications;
pub mod service;
pub mod webhook;

pub use builder::{BuildHook, BuildRequest, BuilderSettings, DockerBuilderService, image_tag};
pub use notifications::{LogNotifier, NotifierRegistry};
pub use service::DeployService;
pub use webhook::WebhookNotifier;
