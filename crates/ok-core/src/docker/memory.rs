//! In-memory Docker daemon.
//!
//! Implements the same idempotency rules as the Engine driver and supports
//! fault injection for the failure paths the runtime has to survive:
//! transient start failures, a racing creator that produces a 409, an
//! unreachable daemon, and read-only mode.

use super::error::{DockerError, DockerErrorKind};
use super::{ContainerCreateConfig, ContainerInfo, ContainerListItem, ContainerState, DockerClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    config: ContainerCreateConfig,
    state: ContainerState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    networks: BTreeSet<String>,
}

impl FakeContainer {
    fn info(&self) -> ContainerInfo {
        let mut ports = BTreeMap::new();
        if self.config.port > 0 && self.config.host_port > 0 {
            ports.insert(self.config.port, self.config.host_port);
        }
        ContainerInfo {
            id: self.id.clone(),
            name: self.config.name.clone(),
            state: self.state,
            running: self.state == ContainerState::Running,
            ports,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: 0,
            error: String::new(),
            labels: self.config.labels.clone(),
            network_mode: if self.config.network.is_empty() {
                "bridge".to_string()
            } else {
                self.config.network.clone()
            },
        }
    }

    fn docker_state(&self) -> &'static str {
        match self.state {
            ContainerState::Running => "running",
            ContainerState::Created => "created",
            _ => "exited",
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeMap<String, FakeContainer>,
    images: BTreeSet<String>,
    next_id: u64,
    read_only: bool,
    unreachable: bool,
    start_failures: u32,
    create_races: BTreeMap<String, ContainerCreateConfig>,
    calls: Vec<String>,
}

impl Inner {
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        let wanted = id_or_name.trim_start_matches('/');
        if self.containers.contains_key(wanted) {
            return Some(wanted.to_string());
        }
        self.containers
            .values()
            .find(|c| c.config.name == wanted)
            .map(|c| c.id.clone())
    }

    fn insert(&mut self, config: ContainerCreateConfig, state: ContainerState) -> String {
        self.next_id += 1;
        let id = format!("{:012x}", 0xc0ffee_000000u64 + self.next_id);
        let now = Utc::now();
        self.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                config,
                state,
                started_at: (state == ContainerState::Running).then_some(now),
                finished_at: (state == ContainerState::Stopped).then_some(now),
                networks: BTreeSet::new(),
            },
        );
        id
    }

    fn precheck(&mut self, op: &str, target: &str, mutation: bool) -> Result<(), DockerError> {
        if self.unreachable {
            return Err(DockerError::unreachable(op, target, "memory daemon offline"));
        }
        if mutation && self.read_only {
            return Err(DockerError::read_only(op, target));
        }
        self.calls.push(format!("{} {}", op, target));
        Ok(())
    }
}

/// A Docker daemon that lives in a mutex.
#[derive(Debug, Default)]
pub struct MemoryDocker {
    inner: Mutex<Inner>,
}

impl MemoryDocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse every mutation like `DOCKER_READ_ONLY=true`.
    pub fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    /// Fail every call as if the socket were gone.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make the next `n` start calls fail with a 500.
    pub fn fail_next_starts(&self, n: u32) {
        self.lock().start_failures = n;
    }

    /// Mark an image as present locally.
    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    /// Seed a container that existed before the agent started.
    pub fn seed_container(&self, config: ContainerCreateConfig, running: bool) -> String {
        let state = if running {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        };
        let mut inner = self.lock();
        inner.images.insert(config.image.clone());
        inner.insert(config, state)
    }

    /// Simulate a concurrent creator: the next create of `config.name` finds
    /// that a stopped container with this config appeared first, and fails
    /// with 409.
    pub fn race_next_create(&self, config: ContainerCreateConfig) {
        self.lock().create_races.insert(config.name.clone(), config);
    }

    /// Operation log, as `"<op> <target>"` entries.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of logged calls for one operation.
    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{} ", op);
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Inspect without logging or fault injection.
    pub fn peek(&self, id_or_name: &str) -> Option<ContainerInfo> {
        let inner = self.lock();
        let id = inner.resolve(id_or_name)?;
        inner.containers.get(&id).map(FakeContainer::info)
    }

    /// The create config a container was made from.
    pub fn create_config(&self, id_or_name: &str) -> Option<ContainerCreateConfig> {
        let inner = self.lock();
        let id = inner.resolve(id_or_name)?;
        inner.containers.get(&id).map(|c| c.config.clone())
    }

    /// Stop a container behind the agent's back.
    pub fn kill(&self, id_or_name: &str) {
        let mut inner = self.lock();
        if let Some(id) = inner.resolve(id_or_name) {
            if let Some(c) = inner.containers.get_mut(&id) {
                c.state = ContainerState::Stopped;
                c.finished_at = Some(Utc::now());
            }
        }
    }
}

#[async_trait]
impl DockerClient for MemoryDocker {
    async fn create_container(&self, config: &ContainerCreateConfig) -> Result<String, DockerError> {
        let mut inner = self.lock();
        inner.precheck("create", &config.name, true)?;
        if let Some(raced) = inner.create_races.remove(&config.name) {
            inner.insert(raced, ContainerState::Stopped);
        }
        if inner.resolve(&config.name).is_some() {
            let mut err = DockerError::new(
                DockerErrorKind::Conflict,
                "create",
                &config.name,
                format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    config.name
                ),
            );
            err.status_code = Some(409);
            return Err(err);
        }
        if !inner.images.contains(&config.image) {
            let mut err = DockerError::new(
                DockerErrorKind::NotFound,
                "create",
                &config.name,
                format!("No such image: {}", config.image),
            );
            err.status_code = Some(404);
            return Err(err);
        }
        Ok(inner.insert(config.clone(), ContainerState::Created))
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("start", id, true)?;
        if inner.start_failures > 0 {
            inner.start_failures -= 1;
            let mut err = DockerError::new(DockerErrorKind::Temporary, "start", id, "HTTP 500");
            err.status_code = Some(500);
            return Err(err);
        }
        let resolved = inner.resolve(id).ok_or_else(|| {
            let mut err =
                DockerError::new(DockerErrorKind::NotFound, "start", id, "No such container");
            err.status_code = Some(404);
            err
        })?;
        if let Some(c) = inner.containers.get_mut(&resolved) {
            if c.state != ContainerState::Running {
                c.state = ContainerState::Running;
                c.started_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("stop", id, true)?;
        if let Some(resolved) = inner.resolve(id) {
            if let Some(c) = inner.containers.get_mut(&resolved) {
                if c.state == ContainerState::Running {
                    c.state = ContainerState::Stopped;
                    c.finished_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("remove", id, true)?;
        let Some(resolved) = inner.resolve(id) else {
            return Ok(());
        };
        let running = inner
            .containers
            .get(&resolved)
            .is_some_and(|c| c.state == ContainerState::Running);
        if running && !force {
            let mut err = DockerError::new(
                DockerErrorKind::Conflict,
                "remove",
                id,
                "You cannot remove a running container",
            );
            err.status_code = Some(409);
            return Err(err);
        }
        inner.containers.remove(&resolved);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError> {
        let mut inner = self.lock();
        inner.precheck("inspect", id, false)?;
        let resolved = inner.resolve(id);
        resolved
            .and_then(|r| inner.containers.get(&r).map(FakeContainer::info))
            .ok_or_else(|| {
                let mut err = DockerError::new(
                    DockerErrorKind::NotFound,
                    "inspect",
                    id,
                    format!("No such container: {}", id),
                );
                err.status_code = Some(404);
                err
            })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListItem>, DockerError> {
        let mut inner = self.lock();
        inner.precheck("list", "containers", false)?;
        Ok(inner
            .containers
            .values()
            .filter(|c| all || c.state == ContainerState::Running)
            .map(|c| ContainerListItem {
                id: c.id.clone(),
                names: vec![format!("/{}", c.config.name)],
                image: c.config.image.clone(),
                state: c.docker_state().to_string(),
                status: c.docker_state().to_string(),
                labels: c.config.labels.clone(),
            })
            .collect())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("network_connect", network, true)?;
        let resolved = inner.resolve(container).ok_or_else(|| {
            DockerError::new(DockerErrorKind::NotFound, "network_connect", network, "No such container")
        })?;
        if let Some(c) = inner.containers.get_mut(&resolved) {
            c.networks.insert(network.to_string());
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("network_disconnect", network, true)?;
        if let Some(resolved) = inner.resolve(container) {
            if let Some(c) = inner.containers.get_mut(&resolved) {
                c.networks.remove(network);
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let mut inner = self.lock();
        inner.precheck("image_inspect", image, false)?;
        Ok(inner.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let mut inner = self.lock();
        inner.precheck("pull", image, true)?;
        inner.images.insert(image.to_string());
        Ok(())
    }
}
