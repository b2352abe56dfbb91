//! Reverse-proxy gateway in front of plugin sidecars.
//!
//! Serves `/plugins/{name}/...` and the legacy `/api/plugins/{name}/...`.
//! Per request: resolve the plugin, apply the admin-only rule, refuse
//! disabled or stopped plugins, compose the UI base path, strip the prefix
//! and forward.

use super::{ApiError, AppState};
use crate::auth::Caller;
use crate::logging::{event_names, Stage};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use ok_common::ErrorCode;
use thiserror::Error;
use tracing::{debug, info};

pub const PLUGINS_PREFIX: &str = "/plugins/";
pub const LEGACY_PREFIX: &str = "/api/plugins/";

/// Words under `/api/plugins/` that belong to the API, never to a plugin.
pub const API_ENDPOINTS: &[&str] = &[
    "list",
    "action",
    "enable",
    "disable",
    "install",
    "uninstall",
    "manifest",
    "security",
];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found")]
    NoRoute,

    #[error("plugin not found: {0}")]
    UnknownPlugin(String),

    #[error("Forbidden")]
    AdminOnly,

    #[error("Plugin is disabled")]
    Disabled,

    #[error("Plugin is not running")]
    NotRunning,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::NoRoute | GatewayError::UnknownPlugin(_) => ApiError::not_found(message),
            GatewayError::AdminOnly | GatewayError::Disabled => ApiError::forbidden(message),
            GatewayError::NotRunning => ApiError::new(ErrorCode::DockerUnavailable, message),
        }
    }
}

/// A request path addressed to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPath<'a> {
    pub name: &'a str,
    /// Remainder after `/{prefix}/{name}`, always starting with `/`.
    pub rest: &'a str,
    pub legacy: bool,
}

/// Split a request path into plugin name and remainder.
///
/// API words under the legacy prefix yield `None`.
pub fn parse_plugin_path(path: &str) -> Option<PluginPath<'_>> {
    let (tail, legacy) = if let Some(tail) = path.strip_prefix(PLUGINS_PREFIX) {
        (tail, false)
    } else if let Some(tail) = path.strip_prefix(LEGACY_PREFIX) {
        (tail, true)
    } else {
        return None;
    };

    let (name, rest) = match tail.find('/') {
        Some(i) => (&tail[..i], &tail[i..]),
        None => (tail, "/"),
    };
    if name.is_empty() || (legacy && API_ENDPOINTS.contains(&name)) {
        return None;
    }
    Some(PluginPath { name, rest, legacy })
}

/// Prefix the remainder with the manifest's UI base path unless it is
/// already there.
pub fn forward_path(ui_path: Option<&str>, rest: &str) -> String {
    let base = ui_path.map(|p| p.trim_matches('/')).unwrap_or_default();
    if base.is_empty() {
        return rest.to_string();
    }
    let base = format!("/{}", base);
    if rest == base || rest.starts_with(&format!("{}/", base)) {
        rest.to_string()
    } else if rest == "/" {
        format!("{}/", base)
    } else {
        format!("{}{}", base, rest)
    }
}

fn is_websocket(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Router fallback: everything that is not an API route lands here.
pub async fn dispatch(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    req: Request<Body>,
) -> Response {
    match serve(&state, &caller, req).await {
        Ok(response) => response,
        Err(e) => {
            debug!(stage = %Stage::Gateway, user = %caller.username, error = %e, "gateway refused request");
            ApiError::from(e).into_response()
        }
    }
}

async fn serve(state: &AppState, caller: &Caller, req: Request<Body>) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    let target = parse_plugin_path(&path).ok_or(GatewayError::NoRoute)?;
    let name = target.name;

    let manager = &state.manager;
    let manifest = manager
        .registry()
        .get(name)
        .ok_or_else(|| GatewayError::UnknownPlugin(name.to_string()))?;
    if manifest.admin_only && !caller.is_admin() {
        return Err(GatewayError::AdminOnly);
    }
    if !manager.store().is_enabled(name) {
        return Err(GatewayError::Disabled);
    }
    let proxy = manager
        .runtime()
        .get_proxy(name)
        .ok_or(GatewayError::NotRunning)?;

    if target.rest.trim_end_matches('/').ends_with("/ws") && is_websocket(&req) {
        info!(
            event = event_names::GATEWAY_WS_CONNECT,
            stage = %Stage::Gateway,
            plugin = %name,
            user = %caller.username,
            "websocket connect"
        );
    }

    let mut forward = forward_path(manifest.ui_path(), target.rest);
    if let Some(query) = req.uri().query() {
        forward.push('?');
        forward.push_str(query);
    }
    debug!(stage = %Stage::Gateway, plugin = %name, legacy = target.legacy, path = %forward, "proxying");
    Ok(proxy.forward(req, &forward).await)
}
