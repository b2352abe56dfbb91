//! Plugin container lifecycle.
//!
//! The runtime owns the live [`PluginInstance`] map and the host-port table.
//! Startup is idempotent: an existing container is adopted (and started if
//! stopped) instead of recreated, so crash recovery and racing enables both
//! converge on one container per plugin.

pub mod health;
pub mod ports;
pub mod proxy;

pub use health::ReadinessProbe;
pub use ports::{PortTable, PORT_RANGE, PORT_RANGE_END, PORT_RANGE_START};
pub use proxy::ReverseProxy;

use crate::docker::{
    ContainerCreateConfig, ContainerInfo, ContainerState, DeviceSpec, DockerClient, DockerError,
    MountSpec, ResourceSpec, SecuritySpec, DEFAULT_STOP_TIMEOUT,
};
use crate::logging::{event_names, Stage};
use crate::plugin::manifest::{parse_cpus, parse_memory, Manifest};
use crate::plugin::manifest_v2::MANIFEST_VERSION_V2;
use chrono::{DateTime, Utc};
use ok_common::ErrorCode;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LABEL_MANAGED: &str = "opskernel.managed";
pub const LABEL_PLUGIN_NAME: &str = "opskernel.plugin.name";
pub const LABEL_PLUGIN_VERSION: &str = "opskernel.plugin.version";
pub const LABEL_MANIFEST_VERSION: &str = "opskernel.manifest.version";

pub const DEFAULT_RESTART_POLICY: &str = "unless-stopped";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{operation} failed for plugin '{plugin}': {source}")]
    Docker {
        plugin: String,
        operation: &'static str,
        #[source]
        source: DockerError,
    },

    #[error("no free host port in 38100-38199 for plugin '{plugin}'")]
    PortsExhausted { plugin: String },

    #[error("plugin container not found: {plugin}")]
    NotFound { plugin: String },
}

impl RuntimeError {
    fn docker(plugin: &str, operation: &'static str, source: DockerError) -> Self {
        RuntimeError::Docker {
            plugin: plugin.to_string(),
            operation,
            source,
        }
    }

    pub fn docker_error(&self) -> Option<&DockerError> {
        match self {
            RuntimeError::Docker { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            RuntimeError::Docker { source, .. } => source.kind.error_code(),
            RuntimeError::PortsExhausted { .. } => ErrorCode::Conflict,
            RuntimeError::NotFound { .. } => ErrorCode::NotFound,
        }
    }

    pub fn retryable(&self) -> bool {
        self.docker_error().is_some_and(|e| e.retryable)
    }
}

/// Live record of one plugin container. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    pub name: String,
    pub container_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub state: ContainerState,
    pub host_port: u16,
    pub internal_port: u16,
    /// `http://127.0.0.1:{host_port}`, empty when no port is published.
    #[serde(rename = "baseURL")]
    pub base_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    /// Present only while running.
    #[serde(skip)]
    pub proxy: Option<Arc<ReverseProxy>>,
    /// Whether the container runs privileged.
    pub privileged: bool,
}

impl PluginInstance {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    fn attach_proxy(&mut self) {
        self.proxy = (self.is_running() && self.host_port > 0)
            .then(|| Arc::new(ReverseProxy::for_port(self.host_port)));
    }
}

fn base_url(port: u16) -> String {
    if port == 0 {
        String::new()
    } else {
        format!("http://127.0.0.1:{}", port)
    }
}

pub struct Runtime {
    docker: Arc<dyn DockerClient>,
    instances: RwLock<BTreeMap<String, PluginInstance>>,
    ports: Mutex<PortTable>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instances", &self.read().len())
            .field("ports", &self.port_table().len())
            .finish()
    }
}

impl Runtime {
    pub fn new(docker: Arc<dyn DockerClient>) -> Self {
        Self {
            docker,
            instances: RwLock::new(BTreeMap::new()),
            ports: Mutex::new(PortTable::new()),
        }
    }

    pub fn docker(&self) -> &Arc<dyn DockerClient> {
        &self.docker
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PluginInstance>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PluginInstance>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    fn port_table(&self) -> MutexGuard<'_, PortTable> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild the instance map from labelled containers.
    ///
    /// Ports are reclaimed for every managed container that publishes one;
    /// proxies are rebuilt only for running ones. Containers that fail to
    /// inspect are skipped. Instances whose container is gone from Docker
    /// are dropped and their ports released.
    pub async fn sync_state(&self) -> Result<usize, RuntimeError> {
        let known: BTreeMap<String, String> = self
            .read()
            .iter()
            .filter(|(_, i)| !i.container_id.is_empty())
            .map(|(n, i)| (n.clone(), i.container_id.clone()))
            .collect();
        let containers = self
            .docker
            .list_containers(true)
            .await
            .map_err(|e| RuntimeError::docker("*", "list", e))?;

        let listed: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
        let mut synced = 0;
        for item in containers {
            if item.labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
                continue;
            }
            let Some(name) = item.labels.get(LABEL_PLUGIN_NAME).filter(|n| !n.is_empty()) else {
                continue;
            };
            let info = match self.docker.inspect_container(&item.id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(stage = %Stage::Runtime, plugin = %name, container = %item.id, error = %e, "skipping container during sync");
                    continue;
                }
            };
            let mut instance = self.instance_from_info(name, &info, None);
            instance.state = ContainerState::from_docker_status(&item.state);
            instance.attach_proxy();
            info!(
                event = event_names::CONTAINER_RECLAIMED,
                stage = %Stage::Runtime,
                plugin = %name,
                container = %instance.container_id,
                port = instance.host_port,
                state = %instance.state,
                "reclaimed managed container"
            );
            self.write().insert(name.clone(), instance);
            synced += 1;
        }

        for (name, container_id) in known {
            if !listed.contains(&container_id) {
                self.forget_vanished(&name, &container_id);
            }
        }
        Ok(synced)
    }

    /// Drop an instance whose container no longer exists. An instance that
    /// was replaced since the listing began is left alone.
    fn forget_vanished(&self, name: &str, container_id: &str) {
        let removed = {
            let mut instances = self.write();
            if instances.get(name).map(|i| i.container_id.as_str()) != Some(container_id) {
                return;
            }
            instances.remove(name)
        };
        let Some(instance) = removed else {
            return;
        };
        let mut ports = self.port_table();
        if instance.host_port > 0 && ports.port_of(name) == Some(instance.host_port) {
            ports.release(name);
        }
        drop(ports);
        warn!(
            event = event_names::CONTAINER_VANISHED,
            stage = %Stage::Runtime,
            plugin = %name,
            container = %container_id,
            port = instance.host_port,
            "managed container disappeared"
        );
    }

    /// Instance for an inspected container; reclaims its published port.
    fn instance_from_info(
        &self,
        name: &str,
        info: &ContainerInfo,
        manifest: Option<&Manifest>,
    ) -> PluginInstance {
        let (container_port, host_port) = info.host_port().unwrap_or((0, 0));
        if host_port > 0 && !self.port_table().reclaim(name, host_port) {
            warn!(
                stage = %Stage::Runtime,
                plugin = %name,
                port = host_port,
                "published port is outside the window or owned by another plugin"
            );
        }
        let internal_port = manifest
            .and_then(|m| u16::try_from(m.docker.port).ok())
            .unwrap_or(container_port);
        let mut instance = PluginInstance {
            name: name.to_string(),
            container_name: info.name.clone(),
            container_id: info.id.clone(),
            state: info.state,
            host_port,
            internal_port,
            base_url: base_url(host_port),
            error: info.error.clone(),
            started_at: info.started_at,
            proxy: None,
            privileged: manifest.is_some_and(Manifest::is_privileged),
        };
        instance.attach_proxy();
        instance
    }

    /// Make sure the plugin's container exists and runs.
    ///
    /// A running in-memory instance is returned as is. Otherwise the
    /// container is looked up by name: an existing one is adopted, a missing
    /// one is created. Any inspect failure other than "not found" is
    /// returned without creating anything.
    pub async fn create_and_start(
        &self,
        manifest: &Manifest,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<PluginInstance, RuntimeError> {
        if let Some(existing) = self.read().get(&manifest.name).filter(|i| i.is_running()) {
            return Ok(existing.clone());
        }

        let container_name = manifest.container_name();
        match self.docker.inspect_container(&container_name).await {
            Ok(info) => self.start_existing(manifest, info).await,
            Err(e) if e.is_not_found() => {
                self.create_new(manifest, &container_name, extra_env).await
            }
            Err(e) => Err(RuntimeError::docker(&manifest.name, "inspect", e)),
        }
    }

    async fn start_existing(
        &self,
        manifest: &Manifest,
        info: ContainerInfo,
    ) -> Result<PluginInstance, RuntimeError> {
        let info = if info.state == ContainerState::Running {
            info
        } else {
            self.docker
                .start_container(&info.id)
                .await
                .map_err(|e| RuntimeError::docker(&manifest.name, "start", e))?;
            self.docker
                .inspect_container(&info.id)
                .await
                .map_err(|e| RuntimeError::docker(&manifest.name, "inspect", e))?
        };

        let instance = self.instance_from_info(&manifest.name, &info, Some(manifest));
        info!(
            event = event_names::CONTAINER_STARTED,
            stage = %Stage::Runtime,
            plugin = %manifest.name,
            container = %instance.container_id,
            port = instance.host_port,
            adopted = true,
            "plugin container running"
        );
        self.write().insert(manifest.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn create_new(
        &self,
        manifest: &Manifest,
        container_name: &str,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<PluginInstance, RuntimeError> {
        let name = manifest.name.as_str();
        let host_port = self
            .port_table()
            .allocate(name, manifest.docker.host_port)
            .ok_or_else(|| RuntimeError::PortsExhausted {
                plugin: name.to_string(),
            })?;

        let config = build_create_config(manifest, container_name, host_port, extra_env);
        let image = manifest.docker.image.as_str();

        let exists = match self.docker.image_exists(image).await {
            Ok(exists) => exists,
            Err(e) => {
                self.port_table().release(name);
                return Err(RuntimeError::docker(name, "image_inspect", e));
            }
        };
        if !exists {
            info!(stage = %Stage::Runtime, plugin = %name, image = %image, "pulling image");
            if let Err(e) = self.docker.pull_image(image).await {
                self.port_table().release(name);
                return Err(RuntimeError::docker(name, "pull", e));
            }
        }

        let container_id = match self.docker.create_container(&config).await {
            Ok(id) => id,
            Err(e) if e.is_conflict() => {
                // Someone else created it first; adopt theirs.
                self.port_table().release(name);
                debug!(stage = %Stage::Runtime, plugin = %name, "create conflicted, adopting existing container");
                let info = self
                    .docker
                    .inspect_container(container_name)
                    .await
                    .map_err(|_| RuntimeError::docker(name, "create", e))?;
                return self.start_existing(manifest, info).await;
            }
            Err(e) => {
                self.port_table().release(name);
                return Err(RuntimeError::docker(name, "create", e));
            }
        };

        if let Err(e) = self.docker.start_container(&container_id).await {
            if let Err(cleanup) = self.docker.remove_container(&container_id, true).await {
                warn!(stage = %Stage::Runtime, plugin = %name, container = %container_id, error = %cleanup, "failed to remove container after start failure");
            }
            self.port_table().release(name);
            return Err(RuntimeError::docker(name, "start", e));
        }

        if let Some(probe) = readiness_probe(manifest, host_port) {
            if !probe.wait().await {
                warn!(
                    stage = %Stage::Runtime,
                    plugin = %name,
                    port = host_port,
                    path = %probe.path,
                    "plugin did not become ready within its start period"
                );
            }
        }

        let mut instance = PluginInstance {
            name: name.to_string(),
            container_name: container_name.to_string(),
            container_id,
            state: ContainerState::Running,
            host_port,
            internal_port: config.port,
            base_url: base_url(host_port),
            error: String::new(),
            started_at: Some(Utc::now()),
            proxy: None,
            privileged: manifest.is_privileged(),
        };
        instance.attach_proxy();
        info!(
            event = event_names::CONTAINER_STARTED,
            stage = %Stage::Runtime,
            plugin = %name,
            container = %instance.container_id,
            port = host_port,
            adopted = false,
            "plugin container running"
        );
        self.write().insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Start a known, stopped container.
    pub async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let Some(instance) = self.get_instance(name).filter(|i| !i.container_id.is_empty()) else {
            return Err(RuntimeError::NotFound {
                plugin: name.to_string(),
            });
        };
        if instance.is_running() {
            return Ok(());
        }
        self.docker
            .start_container(&instance.container_id)
            .await
            .map_err(|e| RuntimeError::docker(name, "start", e))?;

        if let Some(i) = self.write().get_mut(name) {
            i.state = ContainerState::Running;
            i.started_at = Some(Utc::now());
            i.error.clear();
            i.attach_proxy();
        }
        Ok(())
    }

    /// Stop the plugin's container. Unknown or already-stopped plugins are
    /// a no-op; Docker errors are returned.
    pub async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let Some(instance) = self.get_instance(name).filter(|i| !i.container_id.is_empty()) else {
            return Ok(());
        };
        if matches!(
            instance.state,
            ContainerState::Stopped | ContainerState::NotFound
        ) {
            return Ok(());
        }
        self.docker
            .stop_container(&instance.container_id, DEFAULT_STOP_TIMEOUT)
            .await
            .map_err(|e| RuntimeError::docker(name, "stop", e))?;

        if let Some(i) = self.write().get_mut(name) {
            i.state = ContainerState::Stopped;
            i.proxy = None;
        }
        info!(
            event = event_names::CONTAINER_STOPPED,
            stage = %Stage::Runtime,
            plugin = %name,
            container = %instance.container_id,
            "plugin container stopped"
        );
        Ok(())
    }

    /// Forget the instance, release its port, then remove the container.
    ///
    /// Without an in-memory instance the container is still removed by its
    /// conventional name.
    pub async fn remove(&self, name: &str, container_name: &str, force: bool) -> Result<(), RuntimeError> {
        let instance = self.write().remove(name);
        self.port_table().release(name);
        let target = instance
            .map(|i| i.container_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| container_name.to_string());
        self.docker
            .remove_container(&target, force)
            .await
            .map_err(|e| RuntimeError::docker(name, "remove", e))
    }

    /// Copy of the plugin's instance.
    pub fn get_instance(&self, name: &str) -> Option<PluginInstance> {
        self.read().get(name).cloned()
    }

    /// Proxy for a running plugin.
    pub fn get_proxy(&self, name: &str) -> Option<Arc<ReverseProxy>> {
        self.read()
            .get(name)
            .filter(|i| i.is_running())
            .and_then(|i| i.proxy.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.read().get(name).is_some_and(PluginInstance::is_running)
    }

    /// Copies of every instance, ordered by plugin name.
    pub fn list_instances(&self) -> Vec<PluginInstance> {
        self.read().values().cloned().collect()
    }

    /// Snapshot of the port table, ordered by port.
    pub fn port_allocations(&self) -> Vec<(u16, String)> {
        self.port_table().allocations()
    }
}

fn readiness_probe(manifest: &Manifest, port: u16) -> Option<ReadinessProbe> {
    let health = manifest.health_check.as_ref().filter(|h| !h.path.is_empty())?;
    Some(ReadinessProbe {
        port,
        path: health.path.clone(),
        expected_status: health.expected_status(),
        start_period: health.start_period().unwrap_or(health::DEFAULT_START_PERIOD),
    })
}

/// Translate a manifest into the driver's create config.
///
/// The port is published on loopback only. Manifest labels may add to but
/// not replace the management labels.
pub fn build_create_config(
    manifest: &Manifest,
    container_name: &str,
    host_port: u16,
    extra_env: &BTreeMap<String, String>,
) -> ContainerCreateConfig {
    let docker = &manifest.docker;

    let mut labels = docker.labels.clone();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_PLUGIN_NAME.to_string(), manifest.name.clone());
    labels.insert(LABEL_PLUGIN_VERSION.to_string(), manifest.version.clone());
    labels.insert(
        LABEL_MANIFEST_VERSION.to_string(),
        MANIFEST_VERSION_V2.to_string(),
    );

    let env = docker
        .env
        .iter()
        .chain(extra_env.iter())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let resources = docker.resources.as_ref().map(|r| ResourceSpec {
        memory: parse_memory(&r.memory).unwrap_or(0),
        memory_reservation: parse_memory(&r.memory_reservation).unwrap_or(0),
        cpus: parse_cpus(&r.cpus).unwrap_or(0.0),
        cpu_shares: r.cpu_shares,
        pids_limit: r.pids_limit,
    });

    let security = docker.security.as_ref().map(|s| SecuritySpec {
        privileged: s.privileged,
        cap_add: s.cap_add.clone(),
        cap_drop: s.cap_drop.clone(),
        read_only_rootfs: s.read_only_rootfs,
        no_new_privileges: s.no_new_privileges,
        security_opt: s.security_opt.clone(),
        user: s.user.clone(),
    });

    ContainerCreateConfig {
        name: container_name.to_string(),
        image: docker.image.clone(),
        env,
        labels,
        host_port,
        port: u16::try_from(docker.port).unwrap_or(0),
        volumes: docker
            .volumes
            .iter()
            .map(|v| MountSpec {
                source: v.source.clone(),
                target: v.target.clone(),
                read_only: v.read_only,
            })
            .collect(),
        devices: docker
            .devices
            .iter()
            .map(|d| DeviceSpec {
                host: d.host.clone(),
                container: d.container.clone(),
                permissions: d.permissions.clone(),
            })
            .collect(),
        network: docker.network.clone(),
        resources,
        security,
        extra_hosts: docker.extra_hosts.clone(),
        working_dir: docker.working_dir.clone(),
        entrypoint: docker.entrypoint.clone(),
        command: docker.command.clone(),
        restart: if docker.restart_policy.is_empty() {
            DEFAULT_RESTART_POLICY.to_string()
        } else {
            docker.restart_policy.clone()
        },
        shm_size: parse_memory(&docker.shm_size).unwrap_or(0),
    }
}
