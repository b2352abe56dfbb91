//! `/api/plugins/*` handlers.

use super::{ApiError, AppState};
use crate::auth::Caller;
use crate::plugin::manager::{EnableRequest, PluginSummary};
use crate::plugin::manifest::{Manifest, SecuritySummary};
use crate::plugin::store::Confirmation;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameBody {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub acknowledged_risk: String,
    #[serde(default)]
    pub acknowledged_permissions: Vec<String>,
    #[serde(default)]
    pub acknowledged_docker_params: Vec<String>,
    #[serde(default)]
    pub explicit_approval: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBody {
    #[serde(default)]
    pub name: String,
    /// `enable` or `disable`.
    #[serde(default)]
    pub action: Option<String>,
    /// Older clients send a boolean instead of `action`.
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub remove_data: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct NameQuery {
    #[serde(default)]
    pub name: String,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e.body_text())))
}

fn required_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    Ok(name)
}

fn require_admin(caller: &Caller) -> Result<(), ApiError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("Admin access required"))
    }
}

fn context(name: &str, action: &str) -> Value {
    json!({ "plugin": name, "action": action })
}

/// GET /api/plugins/list
pub async fn list(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
) -> Json<Vec<PluginSummary>> {
    Json(state.manager.list(&caller))
}

/// POST /api/plugins/enable
pub async fn enable(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    payload: Result<Json<EnableBody>, JsonRejection>,
) -> ApiResult<Value> {
    let req = body(payload)?;
    let name = required_name(&req.name)?.to_string();

    let confirmation = req.explicit_approval.then(|| Confirmation {
        plugin_name: name.clone(),
        username: caller.username.clone(),
        acknowledged_risk: req.acknowledged_risk,
        acknowledged_permissions: req.acknowledged_permissions,
        acknowledged_docker_params: req.acknowledged_docker_params,
        explicit_approval: true,
        timestamp: Utc::now(),
    });
    let result = state
        .manager
        .enable(EnableRequest {
            name: name.clone(),
            caller,
            confirmation,
        })
        .await
        .map_err(|e| ApiError::from(e).with_details(context(&name, "enable")))?;

    let mut value = serde_json::to_value(&result)
        .map_err(|e| ApiError::new(ok_common::ErrorCode::InternalError, e.to_string()))?;
    if result.success {
        value["status"] = json!("ok");
    }
    Ok(Json(value))
}

/// POST /api/plugins/disable
pub async fn disable(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    payload: Result<Json<NameBody>, JsonRejection>,
) -> ApiResult<Value> {
    let req = body(payload)?;
    let name = required_name(&req.name)?;
    state
        .manager
        .disable(name, &caller)
        .await
        .map_err(|e| ApiError::from(e).with_details(context(name, "disable")))?;
    Ok(Json(json!({
        "status": "ok",
        "success": true,
        "message": format!("Plugin {} disabled successfully", name),
    })))
}

/// POST /api/plugins/action
///
/// Admin toggle. Enabling acknowledges the manifest on the admin's behalf.
pub async fn action(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    payload: Result<Json<ActionBody>, JsonRejection>,
) -> ApiResult<Value> {
    require_admin(&caller)?;
    let req = body(payload)?;
    let name = required_name(&req.name)?;
    let enabled = match (req.action.as_deref(), req.enabled) {
        (Some("enable"), _) => true,
        (Some("disable"), _) => false,
        (Some(other), _) => {
            return Err(ApiError::bad_request(format!(
                "unknown action '{}': expected enable or disable",
                other
            )))
        }
        (None, Some(enabled)) => enabled,
        (None, None) => return Err(ApiError::bad_request("action is required")),
    };
    let verb = if enabled { "enable" } else { "disable" };

    let result = state
        .manager
        .toggle(name, enabled, &caller)
        .await
        .map_err(|e| ApiError::from(e).with_details(context(name, verb)))?;
    Ok(Json(json!({
        "status": "ok",
        "success": result.success,
        "message": result.message,
    })))
}

/// POST /api/plugins/install
pub async fn install(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    payload: Result<Json<NameBody>, JsonRejection>,
) -> ApiResult<Value> {
    require_admin(&caller)?;
    let req = body(payload)?;
    let name = required_name(&req.name)?;
    let result = state
        .manager
        .install(name, &caller)
        .map_err(|e| ApiError::from(e).with_details(context(name, "install")))?;
    serde_json::to_value(result)
        .map(Json)
        .map_err(|e| ApiError::new(ok_common::ErrorCode::InternalError, e.to_string()))
}

/// POST /api/plugins/uninstall
pub async fn uninstall(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    payload: Result<Json<UninstallBody>, JsonRejection>,
) -> ApiResult<Value> {
    require_admin(&caller)?;
    let req = body(payload)?;
    let name = required_name(&req.name)?;
    let result = state
        .manager
        .uninstall(name, &caller, req.remove_data)
        .await
        .map_err(|e| {
            ApiError::from(e).with_details(json!({
                "plugin": name,
                "action": "uninstall",
                "removeData": req.remove_data,
            }))
        })?;
    serde_json::to_value(result)
        .map(Json)
        .map_err(|e| ApiError::new(ok_common::ErrorCode::InternalError, e.to_string()))
}

fn query_name(query: Result<Query<NameQuery>, QueryRejection>) -> Result<String, ApiError> {
    let Query(q) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let name = q.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name parameter required"));
    }
    Ok(name.to_string())
}

/// GET /api/plugins/manifest?name=
pub async fn manifest(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    query: Result<Query<NameQuery>, QueryRejection>,
) -> ApiResult<Manifest> {
    require_admin(&caller)?;
    let name = query_name(query)?;
    let manifest = state.manager.get_manifest(&name)?;
    Ok(Json(Manifest::clone(&manifest)))
}

/// GET /api/plugins/security?name=
///
/// Admin-only plugins look absent to viewers, as in the list.
pub async fn security(
    Extension(caller): Extension<Caller>,
    State(state): State<AppState>,
    query: Result<Query<NameQuery>, QueryRejection>,
) -> ApiResult<SecuritySummary> {
    let name = query_name(query)?;
    let manifest = state.manager.get_manifest(&name)?;
    if manifest.admin_only && !caller.is_admin() {
        return Err(ApiError::not_found(format!("plugin not found: {}", name)));
    }
    Ok(Json(manifest.security_summary()))
}
