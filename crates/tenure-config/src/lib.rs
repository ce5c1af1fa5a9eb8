//! Tenure Lifecycle Configuration
//!
//! One explicit [`LifecycleConfig`] is loaded at process start and passed by
//! reference to the lifecycle orchestrator. Sources are layered: built-in
//! defaults, an optional TOML file, then `TENURE__*` environment variables.

pub mod error;
pub mod loader;
pub mod types;

#[cfg(test)]
mod types_properties;

pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use types::{
    ClassificationConfig, ConfigStore, DownstreamConfig, EnvironmentKind, LifecycleConfig,
    LockingConfig, LoggingConfig, PathsConfig, StagePaths, SystemOfRecordConfig, TopologyConfig,
};
