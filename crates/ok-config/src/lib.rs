//! OpsKernel agent configuration.
//!
//! This crate provides:
//! - Plugin policy presets (`default`, `strict`)
//! - Agent settings resolution (CLI → env → defaults)
//! - Docker Engine endpoint settings read from the standard Docker env vars

pub mod docker;
pub mod preset;
pub mod resolve;

pub use docker::{DockerEndpoint, DockerSettings};
pub use preset::{PolicyFlags, PolicyPreset, PresetError};
pub use resolve::{AgentConfig, ConfigError, ConfigOverrides, ConfigSource, ConfigSources};
