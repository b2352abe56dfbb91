//! In-process agent harness for API and gateway tests.
//!
//! Wires a real registry, store and policy to an in-memory Docker daemon and
//! serves the router through `tower::ServiceExt::oneshot`. Sidecars that the
//! gateway proxies to are real axum servers bound inside the host-port
//! window.

#![allow(dead_code)]
// Test support provides more helpers than any single test uses.

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode, Uri};
use axum::Router;
use ok_common::Role;
use ok_core::api::{create_router, AppState};
use ok_core::auth::TokenAuthority;
use ok_core::docker::MemoryDocker;
use ok_core::plugin::{PluginManager, PluginPolicy, Registry, Store};
use ok_core::runtime::ports::PORT_RANGE;
use ok_core::runtime::Runtime;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const SECRET: &[u8] = b"integration-secret-0123456789abcdef";

/// One agent instance over a temp directory.
pub struct Agent {
    pub dir: TempDir,
    pub docker: Arc<MemoryDocker>,
    pub manager: Arc<PluginManager>,
    pub tokens: TokenAuthority,
    router: Router,
}

impl Agent {
    /// Fresh agent over `manifests`, already loaded.
    pub async fn start(manifests: &[Value]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        for m in manifests {
            write_manifest(dir.path(), m);
        }
        Self::boot(dir, Arc::new(MemoryDocker::new())).await
    }

    /// Agent over an existing directory and daemon, as after a restart.
    pub async fn boot(dir: TempDir, docker: Arc<MemoryDocker>) -> Self {
        let tokens = TokenAuthority::new(SECRET);
        let manager = PluginManager::new(
            Registry::new(dir.path().join("plugins")),
            Store::open(state_file(dir.path()), None).expect("open store"),
            PluginPolicy::default(),
            Runtime::new(docker.clone()),
        )
        .with_tokens(tokens.clone());
        manager.load().await.expect("load plugins");
        let manager = Arc::new(manager);
        let router = create_router(AppState::new(Arc::clone(&manager), tokens.clone()));
        Self {
            dir,
            docker,
            manager,
            tokens,
            router,
        }
    }

    /// Stop this agent and boot a new one over the same state and daemon.
    pub async fn restart(self) -> Self {
        let Agent { dir, docker, .. } = self;
        Self::boot(dir, docker).await
    }

    pub fn state_file(&self) -> PathBuf {
        state_file(self.dir.path())
    }

    pub fn persisted_state(&self) -> Value {
        let bytes = std::fs::read(self.state_file()).expect("read state file");
        serde_json::from_slice(&bytes).expect("state file is JSON")
    }

    pub fn admin(&self) -> String {
        self.token("ada", Role::Admin)
    }

    pub fn viewer(&self) -> String {
        self.token("val", Role::Viewer)
    }

    pub fn token(&self, user: &str, role: Role) -> String {
        self.tokens
            .issue(user, role, Duration::from_secs(3600))
            .expect("issue token")
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.expect("router is infallible")
    }

    pub async fn get(&self, token: &str, uri: &str) -> (StatusCode, Value) {
        let resp = self.send(get_request(token, uri)).await;
        let status = resp.status();
        (status, body_json(resp).await)
    }

    pub async fn post(&self, token: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.send(json_request(token, Method::POST, uri, body)).await;
        let status = resp.status();
        (status, body_json(resp).await)
    }
}

fn state_file(root: &Path) -> PathBuf {
    root.join("data").join("plugins-state.json")
}

pub fn write_manifest(root: &Path, body: &Value) {
    let name = body["name"].as_str().expect("manifest name");
    let dir = root.join("plugins").join(name);
    std::fs::create_dir_all(&dir).expect("create plugin dir");
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec_pretty(body).expect("serialize manifest"),
    )
    .expect("write manifest");
}

/// A minimal valid manifest.
pub fn manifest(name: &str, risk: &str) -> Value {
    serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "description": format!("{} plugin", name),
        "risk": risk,
        "permissions": ["net:local"],
        "docker": { "image": format!("opskernel/{}:1.0", name), "port": 8080 }
    })
}

/// Enable body that acknowledges everything `manifest(name, risk)` declares.
pub fn approval(name: &str, risk: &str) -> Value {
    serde_json::json!({
        "name": name,
        "acknowledgedRisk": risk,
        "acknowledgedPermissions": ["net:local"],
        "explicitApproval": true
    })
}

pub fn get_request(token: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .expect("build request")
}

pub fn json_request(token: &str, method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("serialize body")))
        .expect("build request")
}

pub async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = body_bytes(resp).await;
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Bind a loopback listener on a free port inside the host-port window.
///
/// Tests in one binary run in parallel; each gets its own port by trying
/// from the top of the window down.
pub async fn bind_window_port() -> (tokio::net::TcpListener, u16) {
    for port in PORT_RANGE.rev() {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            return (listener, port);
        }
    }
    panic!("no free port in the host-port window");
}

/// Serve a sidecar that echoes the path and query it received as
/// `sidecar <path?query>`. Returns its port.
pub async fn start_echo_sidecar() -> u16 {
    let (listener, port) = bind_window_port().await;
    let app = Router::new().fallback(|uri: Uri| async move {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        format!("sidecar {}", path)
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}
