//! Docker Engine HTTP driver.
//!
//! Each call opens a fresh HTTP/1.1 connection to the daemon (unix socket or
//! TCP), so no keep-alive state survives between calls. Connecting and
//! waiting for response headers share one deadline; response bodies are
//! always drained before returning.

use super::error::DockerError;
use super::retry::RetryPolicy;
use super::{
    ContainerCreateConfig, ContainerInfo, ContainerListItem, ContainerState, DockerClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use ok_config::{ConfigError, DockerEndpoint, DockerSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Deadline for connecting and receiving response headers.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct EngineClient {
    settings: DockerSettings,
    retry: RetryPolicy,
    timeout: Duration,
}

impl EngineClient {
    pub fn new(settings: DockerSettings) -> Self {
        Self {
            settings,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Build a client from `DOCKER_HOST`, `DOCKER_API_VERSION` and
    /// `DOCKER_READ_ONLY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(DockerSettings::from_env()?))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    fn guard_mutation(&self, operation: &str, target: &str) -> Result<(), DockerError> {
        if self.settings.read_only {
            debug!(operation, target, "refusing docker mutation in read-only mode");
            return Err(DockerError::read_only(operation, target));
        }
        Ok(())
    }

    /// Issue one request and return the status with the fully drained body.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        operation: &str,
        target: &str,
    ) -> Result<(StatusCode, Bytes), DockerError> {
        let uri = format!("{}{}", self.settings.api_prefix(), path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri.as_str())
            .header(HOST, "docker");
        let body = match body {
            Some(bytes) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(body)
            .map_err(|e| DockerError::decode(operation, target, e))?;

        debug!(operation, target, method = %method, path = %uri, "docker request");

        let response = tokio::time::timeout(self.timeout, self.dispatch(request, operation, target))
            .await
            .map_err(|_| DockerError::timeout(operation, target))??;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DockerError::unreachable(operation, target, e))?
            .to_bytes();
        Ok((status, body))
    }

    async fn dispatch(
        &self,
        request: Request<Full<Bytes>>,
        operation: &str,
        target: &str,
    ) -> Result<Response<Incoming>, DockerError> {
        match &self.settings.endpoint {
            #[cfg(unix)]
            DockerEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| DockerError::unreachable(operation, target, e))?;
                send_over(stream, request, operation, target).await
            }
            #[cfg(not(unix))]
            DockerEndpoint::Unix(path) => Err(DockerError::unreachable(
                operation,
                target,
                format!("unix sockets are not supported here: {}", path.display()),
            )),
            DockerEndpoint::Tcp(authority) => {
                let stream = TcpStream::connect(authority.as_str())
                    .await
                    .map_err(|e| DockerError::unreachable(operation, target, e))?;
                send_over(stream, request, operation, target).await
            }
        }
    }

    async fn start_once(&self, id: &str) -> Result<(), DockerError> {
        let path = format!("/containers/{}/start", urlencoding::encode(id));
        let (status, body) = self.call(Method::POST, &path, None, "start", id).await?;
        match status.as_u16() {
            204 | 304 => Ok(()),
            code => Err(DockerError::from_status("start", id, code, &body)),
        }
    }
}

async fn send_over<S>(
    stream: S,
    request: Request<Full<Bytes>>,
    operation: &str,
    target: &str,
) -> Result<Response<Incoming>, DockerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| DockerError::unreachable(operation, target, e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "docker connection closed with error");
        }
    });
    sender
        .send_request(request)
        .await
        .map_err(|e| DockerError::unreachable(operation, target, e))
}

#[async_trait]
impl DockerClient for EngineClient {
    async fn create_container(&self, config: &ContainerCreateConfig) -> Result<String, DockerError> {
        self.guard_mutation("create", &config.name)?;
        let payload = serde_json::to_vec(&CreateBody::from_config(config))
            .map_err(|e| DockerError::decode("create", &config.name, e))?;
        let path = format!("/containers/create?name={}", urlencoding::encode(&config.name));
        let (status, body) = self
            .call(Method::POST, &path, Some(payload), "create", &config.name)
            .await?;
        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(DockerError::from_status("create", &config.name, status.as_u16(), &body));
        }
        let created: CreateResponse = serde_json::from_slice(&body)
            .map_err(|e| DockerError::decode("create", &config.name, e))?;
        for warning in created.warnings.iter().flatten() {
            warn!(container = %config.name, warning = %warning, "docker create warning");
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.guard_mutation("start", id)?;
        self.retry.run("start", || self.start_once(id)).await
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), DockerError> {
        self.guard_mutation("stop", id)?;
        let path = format!(
            "/containers/{}/stop?t={}",
            urlencoding::encode(id),
            timeout.as_secs()
        );
        let (status, body) = self.call(Method::POST, &path, None, "stop", id).await?;
        match status.as_u16() {
            204 | 304 | 404 => Ok(()),
            code => Err(DockerError::from_status("stop", id, code, &body)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        self.guard_mutation("remove", id)?;
        let path = format!(
            "/containers/{}?force={}&v=1",
            urlencoding::encode(id),
            if force { 1 } else { 0 }
        );
        let (status, body) = self.call(Method::DELETE, &path, None, "remove", id).await?;
        match status.as_u16() {
            200 | 204 | 404 => Ok(()),
            code => Err(DockerError::from_status("remove", id, code, &body)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError> {
        let path = format!("/containers/{}/json", urlencoding::encode(id));
        let (status, body) = self.call(Method::GET, &path, None, "inspect", id).await?;
        if status != StatusCode::OK {
            return Err(DockerError::from_status("inspect", id, status.as_u16(), &body));
        }
        let raw: InspectResponse =
            serde_json::from_slice(&body).map_err(|e| DockerError::decode("inspect", id, e))?;
        Ok(raw.into_info())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerListItem>, DockerError> {
        let path = format!("/containers/json?all={}", if all { 1 } else { 0 });
        let (status, body) = self.call(Method::GET, &path, None, "list", "containers").await?;
        if status != StatusCode::OK {
            return Err(DockerError::from_status("list", "containers", status.as_u16(), &body));
        }
        let rows: Vec<ListRow> = serde_json::from_slice(&body)
            .map_err(|e| DockerError::decode("list", "containers", e))?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerListItem {
                id: row.id,
                names: row.names,
                image: row.image,
                state: row.state,
                status: row.status,
                labels: row.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError> {
        self.guard_mutation("network_connect", network)?;
        let payload = serde_json::to_vec(&NetworkBody {
            container,
            force: None,
        })
        .map_err(|e| DockerError::decode("network_connect", network, e))?;
        let path = format!("/networks/{}/connect", urlencoding::encode(network));
        let (status, body) = self
            .call(Method::POST, &path, Some(payload), "network_connect", network)
            .await?;
        if !status.is_success() {
            return Err(DockerError::from_status("network_connect", network, status.as_u16(), &body));
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), DockerError> {
        self.guard_mutation("network_disconnect", network)?;
        let payload = serde_json::to_vec(&NetworkBody {
            container,
            force: Some(force),
        })
        .map_err(|e| DockerError::decode("network_disconnect", network, e))?;
        let path = format!("/networks/{}/disconnect", urlencoding::encode(network));
        let (status, body) = self
            .call(Method::POST, &path, Some(payload), "network_disconnect", network)
            .await?;
        if !status.is_success() {
            return Err(DockerError::from_status(
                "network_disconnect",
                network,
                status.as_u16(),
                &body,
            ));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let path = format!("/images/{}/json", urlencoding::encode(image));
        let (status, body) = self.call(Method::GET, &path, None, "image_inspect", image).await?;
        match status.as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(DockerError::from_status("image_inspect", image, code, &body)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        self.guard_mutation("pull", image)?;
        let path = format!("/images/create?fromImage={}", urlencoding::encode(image));
        let (status, body) = self.call(Method::POST, &path, None, "pull", image).await?;
        if !status.is_success() {
            return Err(DockerError::from_status("pull", image, status.as_u16(), &body));
        }
        // The daemon reports pull failures inside the 200 progress stream.
        if let Some(message) = pull_stream_error(&body) {
            return Err(DockerError::new(
                super::DockerErrorKind::Unknown,
                "pull",
                image,
                message,
            ));
        }
        Ok(())
    }
}

fn pull_stream_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find_map(|event| event.get("error").and_then(|e| e.as_str()).map(str::to_string))
}

// ============================================================================
// Create payload
// ============================================================================

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody {
    image: String,
    labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cmd: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    exposed_ports: BTreeMap<String, Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    host_config: HostConfig,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    port_bindings: BTreeMap<String, Vec<PortBinding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_mode: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    binds: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    devices: Vec<DeviceMapping>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_policy: Option<RestartPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_reservation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nano_cpus: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pids_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shm_size: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    privileged: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cap_add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cap_drop: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    readonly_rootfs: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    security_opt: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceMapping {
    path_on_host: String,
    path_in_container: String,
    cgroup_permissions: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RestartPolicy {
    name: String,
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn positive(v: i64) -> Option<i64> {
    (v > 0).then_some(v)
}

impl CreateBody {
    fn from_config(config: &ContainerCreateConfig) -> Self {
        let mut host = HostConfig {
            network_mode: non_empty(&config.network),
            extra_hosts: config.extra_hosts.clone(),
            shm_size: positive(config.shm_size),
            ..HostConfig::default()
        };

        let mut exposed_ports = BTreeMap::new();
        if config.port > 0 {
            let key = format!("{}/tcp", config.port);
            exposed_ports.insert(key.clone(), Empty {});
            // Published on loopback only; the gateway is the public surface.
            if config.host_port > 0 {
                host.port_bindings.insert(
                    key,
                    vec![PortBinding {
                        host_ip: "127.0.0.1".to_string(),
                        host_port: config.host_port.to_string(),
                    }],
                );
            }
        }

        host.binds = config
            .volumes
            .iter()
            .map(|v| {
                let mut bind = format!("{}:{}", v.source, v.target);
                if v.read_only {
                    bind.push_str(":ro");
                }
                bind
            })
            .collect();

        host.devices = config
            .devices
            .iter()
            .map(|d| DeviceMapping {
                path_on_host: d.host.clone(),
                path_in_container: if d.container.is_empty() {
                    d.host.clone()
                } else {
                    d.container.clone()
                },
                cgroup_permissions: if d.permissions.is_empty() {
                    "rwm".to_string()
                } else {
                    d.permissions.clone()
                },
            })
            .collect();

        host.restart_policy = non_empty(&config.restart).map(|name| RestartPolicy { name });

        if let Some(res) = &config.resources {
            host.memory = positive(res.memory);
            host.memory_reservation = positive(res.memory_reservation);
            if res.cpus > 0.0 {
                host.nano_cpus = Some((res.cpus * 1e9) as i64);
            }
            host.cpu_shares = positive(res.cpu_shares);
            host.pids_limit = positive(res.pids_limit);
        }

        let mut user = None;
        if let Some(sec) = &config.security {
            host.privileged = sec.privileged;
            host.cap_add = sec.cap_add.clone();
            host.cap_drop = sec.cap_drop.clone();
            host.readonly_rootfs = sec.read_only_rootfs;
            host.security_opt = sec.security_opt.clone();
            if sec.no_new_privileges
                && !host
                    .security_opt
                    .iter()
                    .any(|o| o.starts_with("no-new-privileges"))
            {
                host.security_opt.push("no-new-privileges:true".to_string());
            }
            user = non_empty(&sec.user);
        }

        CreateBody {
            image: config.image.clone(),
            labels: config.labels.clone(),
            env: config.env.clone(),
            working_dir: non_empty(&config.working_dir),
            entrypoint: config.entrypoint.clone(),
            cmd: config.command.clone(),
            exposed_ports,
            user,
            host_config: host,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkBody<'a> {
    container: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    force: Option<bool>,
}

// ============================================================================
// Inspect / list responses
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectResponse {
    id: String,
    name: String,
    state: InspectState,
    network_settings: InspectNetwork,
    host_config: InspectHostConfig,
    config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    status: String,
    running: bool,
    started_at: String,
    finished_at: String,
    exit_code: i64,
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectNetwork {
    ports: Option<BTreeMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectHostConfig {
    network_mode: String,
    port_bindings: Option<BTreeMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectBinding {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectConfig {
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListRow {
    id: String,
    names: Vec<String>,
    image: String,
    state: String,
    status: String,
    labels: Option<BTreeMap<String, String>>,
}

type RawPorts = BTreeMap<String, Option<Vec<InspectBinding>>>;

fn parse_ports(raw: &RawPorts) -> BTreeMap<u16, u16> {
    let mut ports = BTreeMap::new();
    for (key, bindings) in raw {
        let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .iter()
            .flatten()
            .find_map(|b| b.host_port.parse::<u16>().ok().filter(|p| *p > 0));
        if let Some(host_port) = host_port {
            ports.insert(container_port, host_port);
        }
    }
    ports
}

/// Docker reports "never" as `0001-01-01T00:00:00Z`.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.year() > 1)
}

impl InspectResponse {
    fn into_info(self) -> ContainerInfo {
        // Live bindings first; a stopped container only carries the requested ones.
        let mut ports = self
            .network_settings
            .ports
            .as_ref()
            .map(parse_ports)
            .unwrap_or_default();
        if ports.is_empty() {
            ports = self
                .host_config
                .port_bindings
                .as_ref()
                .map(parse_ports)
                .unwrap_or_default();
        }
        let state = if self.state.running {
            ContainerState::Running
        } else {
            ContainerState::from_docker_status(&self.state.status)
        };
        ContainerInfo {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            state,
            running: self.state.running,
            ports,
            started_at: parse_timestamp(&self.state.started_at),
            finished_at: parse_timestamp(&self.state.finished_at),
            exit_code: self.state.exit_code,
            error: self.state.error,
            labels: self.config.labels.unwrap_or_default(),
            network_mode: self.host_config.network_mode,
        }
    }
}
