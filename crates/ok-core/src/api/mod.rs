//! HTTP surface of the plugin subsystem.
//!
//! ```text
//! /api/plugins/{list,action,enable,disable,install,uninstall,manifest,security}
//! /plugins/{name}/...        gateway (canonical)
//! /api/plugins/{name}/...    gateway (legacy alias)
//! ```
//!
//! Every route requires a session token; the authenticated [`Caller`] is
//! attached as a request extension before any handler runs.

pub mod error;
pub mod gateway;
pub mod handlers;

pub use error::ApiError;

use crate::auth::{Caller, TokenAuthority};
use crate::plugin::manager::PluginManager;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::debug;

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
    pub tokens: Arc<TokenAuthority>,
}

impl AppState {
    pub fn new(manager: Arc<PluginManager>, tokens: TokenAuthority) -> Self {
        Self {
            manager,
            tokens: Arc::new(tokens),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/plugins/list", get(handlers::list))
        .route("/api/plugins/action", post(handlers::action))
        .route("/api/plugins/enable", post(handlers::enable))
        .route("/api/plugins/disable", post(handlers::disable))
        .route("/api/plugins/install", post(handlers::install))
        .route("/api/plugins/uninstall", post(handlers::uninstall))
        .route("/api/plugins/manifest", get(handlers::manifest))
        .route("/api/plugins/security", get(handlers::security))
        .fallback(gateway::dispatch)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller: Caller = match state.tokens.authenticate(request.headers()) {
        Ok(caller) => caller,
        Err(e) => {
            debug!(path = %request.uri().path(), error = %e, "rejected request");
            return ApiError::unauthorized(&e).into_response();
        }
    };
    request.extensions_mut().insert(caller);
    next.run(request).await
}
