//! Docker Engine access for plugin sidecars.
//!
//! The runtime talks to Docker only through the [`DockerClient`] capability
//! set. [`EngineClient`] speaks the Engine HTTP API over a unix socket or TCP;
//! [`MemoryDocker`] keeps containers in memory and is what the tests drive.
//!
//! Idempotency is part of the contract, not a caller concern:
//! - starting a running container succeeds (304)
//! - stopping a stopped or missing container succeeds (304, 404)
//! - removing a missing container succeeds (404)

pub mod engine;
pub mod error;
pub mod memory;
pub mod retry;

pub use engine::EngineClient;
pub use error::{DockerError, DockerErrorKind};
pub use memory::MemoryDocker;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default grace period Docker waits before SIGKILL on stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a plugin container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
    NotFound,
    Error,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Unknown => "unknown",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::NotFound => "not_found",
            ContainerState::Error => "error",
        }
    }

    /// Map Docker's `State.Status` / list `State` string.
    pub fn from_docker_status(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "running" => ContainerState::Running,
            "created" | "paused" | "restarting" => ContainerState::Created,
            "exited" | "dead" | "removing" => ContainerState::Stopped,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A host path or named volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path for bind mounts, volume name for named volumes.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// A host device exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host: String,
    /// Defaults to the host path when empty.
    pub container: String,
    /// Cgroup permissions; defaults to `rwm` when empty.
    pub permissions: String,
}

/// Resource limits in Engine API units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSpec {
    /// Bytes; 0 means unlimited.
    pub memory: i64,
    /// Bytes; 0 leaves the daemon default.
    pub memory_reservation: i64,
    /// Fractional CPUs; sent as NanoCpus.
    pub cpus: f64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
}

/// Security-relevant container options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecuritySpec {
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub read_only_rootfs: bool,
    pub no_new_privileges: bool,
    pub security_opt: Vec<String>,
    pub user: String,
}

/// Everything the runtime may ask Docker to create.
///
/// Every recognised manifest option has a field here; unrecognised manifest
/// keys never reach the daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerCreateConfig {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Loopback port the container port is published on; 0 publishes nothing.
    pub host_port: u16,
    /// Port the plugin listens on inside the container.
    pub port: u16,
    pub volumes: Vec<MountSpec>,
    pub devices: Vec<DeviceSpec>,
    pub network: String,
    pub resources: Option<ResourceSpec>,
    pub security: Option<SecuritySpec>,
    pub extra_hosts: Vec<String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub restart: String,
    /// Bytes of /dev/shm; 0 leaves the daemon default.
    pub shm_size: i64,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the leading slash.
    pub name: String,
    pub state: ContainerState,
    pub running: bool,
    /// Container port → published host port.
    pub ports: BTreeMap<u16, u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i64,
    pub error: String,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,
}

impl ContainerInfo {
    /// The first published host port, if any.
    pub fn host_port(&self) -> Option<(u16, u16)> {
        self.ports.iter().next().map(|(c, h)| (*c, *h))
    }
}

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerListItem {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    /// Raw Docker state (`running`, `exited`, …).
    pub state: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

/// The capability set the runtime needs from Docker.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Create a container and return its ID.
    async fn create_container(&self, config: &ContainerCreateConfig) -> Result<String, DockerError>;

    /// Start a container; already running is success.
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Stop a container; already stopped or missing is success.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), DockerError>;

    /// Remove a container and its anonymous volumes; missing is success.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;

    /// Inspect a container by ID or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError>;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListItem>, DockerError>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), DockerError>;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, DockerError>;

    /// Pull an image, waiting for the pull to finish.
    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_docker_status() {
        assert_eq!(ContainerState::from_docker_status("running"), ContainerState::Running);
        assert_eq!(ContainerState::from_docker_status("Restarting"), ContainerState::Created);
        assert_eq!(ContainerState::from_docker_status("paused"), ContainerState::Created);
        assert_eq!(ContainerState::from_docker_status("exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::from_docker_status("dead"), ContainerState::Stopped);
        assert_eq!(ContainerState::from_docker_status("weird"), ContainerState::Unknown);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ContainerState::NotFound).unwrap(),
            "\"not_found\""
        );
    }
}
