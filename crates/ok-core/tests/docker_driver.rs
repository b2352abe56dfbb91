//! Engine API driver against a stub daemon.
//!
//! The stub speaks just enough of the Docker Engine HTTP API over loopback
//! TCP (`DOCKER_HOST=tcp://...`) to exercise the driver's request shapes,
//! status mapping, retry loop, and read-only guard.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use ok_config::{DockerEndpoint, DockerSettings};
use ok_core::docker::{
    ContainerCreateConfig, ContainerState, DockerClient, DockerErrorKind, EngineClient,
    RetryPolicy,
};
use ok_core::plugin::Manifest;
use ok_core::runtime::{Runtime, PORT_RANGE};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Stub daemon
// ============================================================================

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: String,
    body: Value,
}

#[derive(Debug, Clone)]
struct StubContainer {
    id: String,
    name: String,
    image: String,
    labels: Value,
    port: String,
    host_port: String,
    running: bool,
}

#[derive(Debug, Default)]
struct StubState {
    requests: Vec<Recorded>,
    containers: Vec<StubContainer>,
    images: BTreeSet<String>,
    start_failures: u32,
    pull_error: Option<String>,
}

#[derive(Debug, Default)]
struct Stub {
    state: Mutex<StubState>,
}

impl Stub {
    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    fn requests(&self) -> Vec<Recorded> {
        self.lock().requests.clone()
    }

    /// `"METHOD /path"` for every request, without the version prefix.
    fn log(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path.trim_start_matches(API_PREFIX)))
            .collect()
    }
}

const API_PREFIX: &str = "/v1.43";

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default())
    })
}

fn inspect_body(c: &StubContainer) -> Value {
    let mut ports = serde_json::Map::new();
    if !c.port.is_empty() {
        ports.insert(
            c.port.clone(),
            json!([{ "HostIp": "127.0.0.1", "HostPort": c.host_port }]),
        );
    }
    json!({
        "Id": c.id,
        "Name": format!("/{}", c.name),
        "State": {
            "Status": if c.running { "running" } else { "exited" },
            "Running": c.running,
            "StartedAt": "2026-10-01T08:00:00Z",
            "FinishedAt": "0001-01-01T00:00:00Z",
            "ExitCode": 0,
            "Error": ""
        },
        "NetworkSettings": { "Ports": ports },
        "HostConfig": { "NetworkMode": "bridge" },
        "Config": { "Labels": c.labels }
    })
}

fn find(state: &StubState, key: &str) -> Option<usize> {
    state
        .containers
        .iter()
        .position(|c| c.id == key || c.name == key)
}

async fn engine(State(stub): State<Arc<Stub>>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let mut state = stub.lock();
    state.requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        body: parsed.clone(),
    });

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return message(StatusCode::BAD_REQUEST, "missing API version");
    };
    let segments: Vec<String> = rest
        .trim_start_matches('/')
        .split('/')
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_default())
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    match (method.as_str(), segments.as_slice()) {
        ("POST", ["containers", "create"]) => {
            let name = query_param(&query, "name").unwrap_or_default();
            if find(&state, &name).is_some() {
                return message(
                    StatusCode::CONFLICT,
                    &format!("Conflict. The container name \"/{}\" is already in use", name),
                );
            }
            let image = parsed["Image"].as_str().unwrap_or_default().to_string();
            if !state.images.contains(&image) {
                return message(StatusCode::NOT_FOUND, &format!("No such image: {}", image));
            }
            let (port, host_port) = parsed["HostConfig"]["PortBindings"]
                .as_object()
                .and_then(|m| m.iter().next())
                .map(|(k, v)| {
                    (
                        k.clone(),
                        v[0]["HostPort"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .unwrap_or_default();
            let id = format!("{:064x}", state.containers.len() + 1);
            state.containers.push(StubContainer {
                id: id.clone(),
                name,
                image,
                labels: parsed["Labels"].clone(),
                port,
                host_port,
                running: false,
            });
            (StatusCode::CREATED, Json(json!({ "Id": id, "Warnings": [] }))).into_response()
        }
        ("GET", ["containers", "json"]) => {
            let rows: Vec<Value> = state
                .containers
                .iter()
                .map(|c| {
                    json!({
                        "Id": c.id,
                        "Names": [format!("/{}", c.name)],
                        "Image": c.image,
                        "State": if c.running { "running" } else { "exited" },
                        "Status": if c.running { "Up 1 minute" } else { "Exited (0)" },
                        "Labels": c.labels
                    })
                })
                .collect();
            Json(Value::Array(rows)).into_response()
        }
        ("POST", ["containers", id, "start"]) => {
            if state.start_failures > 0 {
                state.start_failures -= 1;
                return message(StatusCode::INTERNAL_SERVER_ERROR, "driver failed programming external connectivity");
            }
            match find(&state, id) {
                Some(i) if state.containers[i].running => StatusCode::NOT_MODIFIED.into_response(),
                Some(i) => {
                    state.containers[i].running = true;
                    StatusCode::NO_CONTENT.into_response()
                }
                None => message(StatusCode::NOT_FOUND, &format!("No such container: {}", id)),
            }
        }
        ("POST", ["containers", id, "stop"]) => match find(&state, id) {
            Some(i) => {
                state.containers[i].running = false;
                StatusCode::NO_CONTENT.into_response()
            }
            None => message(StatusCode::NOT_FOUND, &format!("No such container: {}", id)),
        },
        ("DELETE", ["containers", id]) => match find(&state, id) {
            Some(i) => {
                state.containers.remove(i);
                StatusCode::NO_CONTENT.into_response()
            }
            None => message(StatusCode::NOT_FOUND, &format!("No such container: {}", id)),
        },
        ("GET", ["containers", id, "json"]) => match find(&state, id) {
            Some(i) => Json(inspect_body(&state.containers[i])).into_response(),
            None => message(StatusCode::NOT_FOUND, &format!("No such container: {}", id)),
        },
        ("GET", ["images", image, "json"]) => {
            if state.images.contains(*image) {
                Json(json!({ "Id": "sha256:feed" })).into_response()
            } else {
                message(StatusCode::NOT_FOUND, &format!("No such image: {}", image))
            }
        }
        ("POST", ["images", "create"]) => {
            let image = query_param(&query, "fromImage").unwrap_or_default();
            if let Some(err) = state.pull_error.clone() {
                let stream = format!(
                    "{{\"status\":\"Pulling from {}\"}}\n{{\"error\":\"{}\"}}\n",
                    image, err
                );
                return (StatusCode::OK, stream).into_response();
            }
            state.images.insert(image.clone());
            (StatusCode::OK, format!("{{\"status\":\"Downloaded newer image for {}\"}}\n", image))
                .into_response()
        }
        _ => message(StatusCode::NOT_FOUND, "page not found"),
    }
}

async fn start_stub() -> (Arc<Stub>, DockerSettings) {
    let stub = Arc::new(Stub::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(engine).with_state(Arc::clone(&stub));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let settings = DockerSettings::from_lookup(|key| match key {
        "DOCKER_HOST" => Some(format!("tcp://{}", addr)),
        "DOCKER_API_VERSION" => Some("1.43".to_string()),
        _ => None,
    })
    .unwrap();
    (stub, settings)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

fn config(name: &str) -> ContainerCreateConfig {
    ContainerCreateConfig {
        name: name.to_string(),
        image: "opskernel/demo:1.0".to_string(),
        port: 8080,
        host_port: 38105,
        labels: BTreeMap::from([("opskernel.managed".to_string(), "true".to_string())]),
        env: vec!["MODE=test".to_string()],
        ..ContainerCreateConfig::default()
    }
}

// ============================================================================
// Request shapes
// ============================================================================

#[tokio::test]
async fn test_settings_parse_tcp_host_and_version() {
    let (_stub, settings) = start_stub().await;
    assert!(matches!(settings.endpoint, DockerEndpoint::Tcp(_)));
    assert_eq!(settings.api_prefix(), "/v1.43");
    assert!(!settings.read_only);
}

#[tokio::test]
async fn test_create_publishes_loopback_port() {
    let (stub, settings) = start_stub().await;
    stub.lock().images.insert("opskernel/demo:1.0".to_string());
    let client = EngineClient::new(settings);

    let id = client.create_container(&config("opskernel-plugin-demo")).await.unwrap();
    assert_eq!(id.len(), 64);

    let create = &stub.requests()[0];
    assert_eq!(create.method, Method::POST);
    assert_eq!(create.path, "/v1.43/containers/create");
    assert_eq!(create.query, "name=opskernel-plugin-demo");
    assert_eq!(create.body["Image"], "opskernel/demo:1.0");
    assert_eq!(create.body["Env"], json!(["MODE=test"]));
    assert_eq!(create.body["Labels"]["opskernel.managed"], "true");
    assert_eq!(create.body["ExposedPorts"], json!({ "8080/tcp": {} }));
    assert_eq!(
        create.body["HostConfig"]["PortBindings"]["8080/tcp"],
        json!([{ "HostIp": "127.0.0.1", "HostPort": "38105" }])
    );
}

#[tokio::test]
async fn test_inspect_and_list_decode_daemon_json() {
    let (stub, settings) = start_stub().await;
    stub.lock().images.insert("opskernel/demo:1.0".to_string());
    let client = EngineClient::new(settings);
    let id = client.create_container(&config("opskernel-plugin-demo")).await.unwrap();
    client.start_container(&id).await.unwrap();

    let info = client.inspect_container("opskernel-plugin-demo").await.unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.name, "opskernel-plugin-demo");
    assert_eq!(info.state, ContainerState::Running);
    assert_eq!(info.ports, BTreeMap::from([(8080, 38105)]));
    assert_eq!(info.labels["opskernel.managed"], "true");

    let rows = client.list_containers(true).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].names, vec!["/opskernel-plugin-demo".to_string()]);
    assert_eq!(rows[0].state, "running");
    assert_eq!(stub.log().last().unwrap(), "GET /containers/json");
}

// ============================================================================
// Status mapping
// ============================================================================

#[tokio::test]
async fn test_duplicate_create_is_conflict() {
    let (stub, settings) = start_stub().await;
    stub.lock().images.insert("opskernel/demo:1.0".to_string());
    let client = EngineClient::new(settings);
    client.create_container(&config("opskernel-plugin-demo")).await.unwrap();

    let err = client
        .create_container(&config("opskernel-plugin-demo"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.status_code, Some(409));
    assert!(!err.retryable);
    assert!(err.message.contains("already in use"));
}

#[tokio::test]
async fn test_missing_container_and_image() {
    let (_stub, settings) = start_stub().await;
    let client = EngineClient::new(settings);

    let err = client.inspect_container("ghost").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.message, "No such container: ghost");

    assert!(!client.image_exists("opskernel/demo:1.0").await.unwrap());
    // Stop and remove treat a missing container as done.
    client.stop_container("ghost", Duration::from_secs(1)).await.unwrap();
    client.remove_container("ghost", true).await.unwrap();
}

#[tokio::test]
async fn test_pull_error_in_progress_stream() {
    let (stub, settings) = start_stub().await;
    stub.lock().pull_error = Some("manifest unknown".to_string());
    let client = EngineClient::new(settings);

    let err = client.pull_image("opskernel/demo:9.9").await.unwrap_err();
    assert_eq!(err.message, "manifest unknown");
    assert_eq!(err.operation, "pull");

    stub.lock().pull_error = None;
    client.pull_image("opskernel/demo:1.0").await.unwrap();
    assert!(client.image_exists("opskernel/demo:1.0").await.unwrap());
    assert!(stub.log().contains(&"POST /images/create".to_string()));
}

// ============================================================================
// Retry and guards
// ============================================================================

#[tokio::test]
async fn test_start_retries_transient_failures() {
    let (stub, settings) = start_stub().await;
    stub.lock().images.insert("opskernel/demo:1.0".to_string());
    let client = EngineClient::new(settings).with_retry_policy(fast_retry(3));
    let id = client.create_container(&config("opskernel-plugin-demo")).await.unwrap();

    stub.lock().start_failures = 2;
    client.start_container(&id).await.unwrap();

    let starts = stub.log().iter().filter(|l| l.ends_with("/start")).count();
    assert_eq!(starts, 3);
    assert!(client.inspect_container(&id).await.unwrap().running);
}

#[tokio::test]
async fn test_start_gives_up_after_budget() {
    let (stub, settings) = start_stub().await;
    stub.lock().images.insert("opskernel/demo:1.0".to_string());
    let client = EngineClient::new(settings).with_retry_policy(fast_retry(2));
    let id = client.create_container(&config("opskernel-plugin-demo")).await.unwrap();

    stub.lock().start_failures = 10;
    let err = client.start_container(&id).await.unwrap_err();
    assert_eq!(err.kind, DockerErrorKind::Temporary);
    assert_eq!(err.status_code, Some(500));
    assert!(err.retryable);

    let starts = stub.log().iter().filter(|l| l.ends_with("/start")).count();
    assert_eq!(starts, 3, "one attempt plus two retries");
}

#[tokio::test]
async fn test_read_only_refuses_mutations_without_calling_daemon() {
    let (stub, settings) = start_stub().await;
    let client = EngineClient::new(settings.with_read_only(true));
    assert!(client.is_read_only());

    let err = client
        .create_container(&config("opskernel-plugin-demo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, DockerErrorKind::ReadOnly);
    assert!(!err.retryable);
    assert!(client.pull_image("opskernel/demo:1.0").await.is_err());
    assert!(stub.requests().is_empty());

    // Reads still go through.
    client.list_containers(true).await.unwrap();
    assert_eq!(stub.requests().len(), 1);
}

#[tokio::test]
async fn test_unreachable_daemon() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let settings = DockerSettings {
        endpoint: DockerEndpoint::Tcp(addr.to_string()),
        ..DockerSettings::default()
    };
    let client = EngineClient::new(settings);

    let err = client.list_containers(true).await.unwrap_err();
    assert_eq!(err.kind, DockerErrorKind::Unreachable);
    assert!(err.retryable);
}

// ============================================================================
// Runtime over the Engine driver
// ============================================================================

#[tokio::test]
async fn test_runtime_pulls_creates_and_reclaims() {
    let (stub, settings) = start_stub().await;
    let manifest: Manifest = serde_json::from_value(json!({
        "name": "demo",
        "version": "1.0.0",
        "risk": "low",
        "permissions": [],
        "docker": { "image": "opskernel/demo:1.0", "port": 8080 }
    }))
    .unwrap();

    let client = Arc::new(EngineClient::new(settings.clone()).with_retry_policy(fast_retry(1)));
    let runtime = Runtime::new(client);
    let instance = runtime
        .create_and_start(&manifest, &BTreeMap::new())
        .await
        .unwrap();
    assert!(PORT_RANGE.contains(&instance.host_port));
    assert!(instance.is_running());

    assert_eq!(
        stub.log()[..4],
        [
            "GET /containers/opskernel-plugin-demo/json".to_string(),
            "GET /images/opskernel%2Fdemo%3A1.0/json".to_string(),
            "POST /images/create".to_string(),
            "POST /containers/create".to_string(),
        ]
    );

    // A fresh runtime finds the same container and port.
    let fresh = Runtime::new(Arc::new(EngineClient::new(settings)));
    assert_eq!(fresh.sync_state().await.unwrap(), 1);
    let reclaimed = fresh.get_instance("demo").unwrap();
    assert_eq!(reclaimed.host_port, instance.host_port);
    assert_eq!(reclaimed.container_id, instance.container_id);
    assert!(fresh.get_proxy("demo").is_some());
}
