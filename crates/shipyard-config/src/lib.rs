//! KDL configuration parsing for Shipyard.
//!
//! This crate handles parsing of:
//! - System configuration (registry login, builder, executor pool, buddy check)
//! - Stage files describing a project and its deploy pipeline

pub mod error;
mod nodes;
pub mod stages;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use stages::{StageFile, load_stage_file, parse_stage_file};
pub use system::{
    BuddyCheckConfig, BuilderConfig, ClusterConfig, ExecutorConfig, IsolationStrategy,
    SystemConfig, load_system_config, parse_system_config,
};
