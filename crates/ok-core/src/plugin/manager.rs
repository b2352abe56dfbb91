//! Plugin manager.
//!
//! Ties the registry, store, policy and runtime together. None of those
//! components know about each other; every lifecycle operation goes through
//! here and is serialized per plugin.

use super::hooks::{hook_instructions, HookInstruction};
use super::manifest::{Manifest, SecuritySummary, DEPRECATION_WARNING};
use super::policy::{ConfirmationPrompt, PluginPolicy, PolicyCheckResult, PolicyViolation};
use super::registry::{DiscoveryReport, Registry, RegistryError};
use super::store::{Confirmation, Store, StoreError};
use crate::auth::{Caller, TokenAuthority};
use crate::docker::ContainerState;
use crate::logging::{event_names, Stage};
use crate::runtime::{Runtime, RuntimeError};
use chrono::Utc;
use ok_common::{ErrorCode, Permission, RiskLevel};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("policy denied: {}", .0.message)]
    PolicyDenied(PolicyViolation),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ManagerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ManagerError::NotFound(_) => ErrorCode::NotFound,
            ManagerError::PolicyDenied(v) => v.kind.error_code(),
            ManagerError::Runtime(e) => e.error_code(),
            ManagerError::Store(_) | ManagerError::Registry(_) => ErrorCode::InternalError,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ManagerError::Runtime(e) => e.retryable(),
            _ => false,
        }
    }
}

/// A request to enable one plugin.
#[derive(Debug, Clone)]
pub struct EnableRequest {
    pub name: String,
    pub caller: Caller,
    pub confirmation: Option<Confirmation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_prompt: Option<ConfirmationPrompt>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Manual host steps; hooks are never executed by the agent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<HookInstruction>,
}

/// One row of the plugin list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub risk: RiskLevel,
    pub permissions: Vec<Permission>,
    pub admin_only: bool,
    pub enabled: bool,
    pub confirmed: bool,
    pub running: bool,
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nav_title: Option<String>,
    pub show_in_nav: bool,
    pub proxy_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_warning: Option<String>,
    /// `privileged` or `normal`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub mode: &'static str,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Plugin name and error text.
    pub failed: Vec<(String, String)>,
}

pub struct PluginManager {
    registry: Registry,
    store: Store,
    policy: PluginPolicy,
    runtime: Runtime,
    tokens: Option<TokenAuthority>,
    agent_url: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.registry.plugins_dir())
            .field("state_file", &self.store.path())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(registry: Registry, store: Store, policy: PluginPolicy, runtime: Runtime) -> Self {
        Self {
            registry,
            store,
            policy,
            runtime,
            tokens: None,
            agent_url: String::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sign `MONITOR_TOKEN` for plugin containers with this authority.
    pub fn with_tokens(mut self, tokens: TokenAuthority) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// URL plugin containers use to reach the agent.
    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = url.into();
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn policy(&self) -> &PluginPolicy {
        &self.policy
    }

    async fn lock_plugin(&self, name: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn manifest(&self, name: &str) -> Result<Arc<Manifest>, ManagerError> {
        self.registry
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    /// Startup: discover manifests, adopt existing containers, then start
    /// every enabled plugin that is not running.
    pub async fn load(&self) -> Result<DiscoveryReport, ManagerError> {
        let report = self.registry.discover()?;
        for manifest in self.registry.list() {
            match self.store.pin_confirmation(&manifest.name, &manifest.content_hash()) {
                Ok(true) => info!(stage = %Stage::Store, plugin = %manifest.name, "pinned migrated confirmation to manifest"),
                Ok(false) => {}
                Err(e) => warn!(stage = %Stage::Store, plugin = %manifest.name, error = %e, "failed to persist plugin state"),
            }
        }
        if let Err(e) = self.runtime.sync_state().await {
            warn!(stage = %Stage::Init, error = %e, "failed to sync container state");
        }
        for name in self.store.enabled_plugins() {
            let _guard = self.lock_plugin(&name).await;
            let Some(manifest) = self.registry.get(&name) else {
                continue;
            };
            if self.runtime.is_running(&name) {
                continue;
            }
            match self.runtime.create_and_start(&manifest, &self.plugin_env(&name)).await {
                Ok(_) => self.log_store(self.store.clear_error(&name)),
                Err(e) => {
                    warn!(event = event_names::PLUGIN_ENABLE_FAILED, stage = %Stage::Init, plugin = %name, error = %e, "failed to start enabled plugin");
                    self.log_store(self.store.set_error(&name, &e.to_string()));
                }
            }
        }
        info!(stage = %Stage::Init, plugins = self.registry.count(), "plugin system loaded");
        Ok(report)
    }

    /// Rescan the plugins directory.
    pub fn refresh(&self) -> Result<DiscoveryReport, ManagerError> {
        Ok(self.registry.discover()?)
    }

    fn log_store(&self, result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!(stage = %Stage::Store, error = %e, "failed to persist plugin state");
        }
    }

    /// Extra environment for a plugin container.
    pub fn plugin_env(&self, name: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(tokens) = &self.tokens {
            match tokens.issue_plugin_token(name) {
                Ok(token) => {
                    env.insert("MONITOR_TOKEN".to_string(), token);
                }
                Err(e) => warn!(plugin = %name, error = %e, "failed to issue plugin token"),
            }
        }
        if !self.agent_url.is_empty() {
            env.insert("OPSKERNEL_URL".to_string(), self.agent_url.clone());
        }
        env.insert("OPSKERNEL_PLUGIN_NAME".to_string(), name.to_string());
        env
    }

    /// Plugins visible to the caller, ordered by name.
    pub fn list(&self, caller: &Caller) -> Vec<PluginSummary> {
        self.registry
            .list()
            .iter()
            .filter(|m| caller.is_admin() || !m.admin_only)
            .map(|m| self.summary(m))
            .collect()
    }

    pub fn summary(&self, manifest: &Manifest) -> PluginSummary {
        let name = manifest.name.as_str();
        let state = self.store.get(name);
        let instance = self.runtime.get_instance(name);

        let error = instance
            .as_ref()
            .map(|i| i.error.clone())
            .filter(|e| !e.is_empty())
            .or(state.last_error.clone());
        let proxy_url = match manifest.ui_path() {
            Some(path) if path.starts_with('/') => format!("/plugins/{}{}", name, path),
            Some(path) => format!("/plugins/{}/{}", name, path),
            None => format!("/plugins/{}/", name),
        };
        let ui = manifest.ui.as_ref();

        PluginSummary {
            name: name.to_string(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            risk: manifest.risk,
            permissions: manifest.permissions.clone(),
            admin_only: manifest.admin_only,
            enabled: state.enabled,
            confirmed: state.confirmed,
            running: instance.as_ref().is_some_and(|i| i.is_running()),
            state: instance
                .as_ref()
                .map(|i| i.state)
                .unwrap_or(ContainerState::NotFound),
            error,
            icon: ui.map(|u| u.icon.clone()).filter(|s| !s.is_empty()),
            nav_title: ui.map(|u| u.title.clone()).filter(|s| !s.is_empty()),
            show_in_nav: ui.is_some_and(|u| u.show_in_nav),
            proxy_url,
            deprecation_warning: self
                .registry
                .is_deprecated_format(name)
                .then(|| DEPRECATION_WARNING.to_string()),
            kind: if manifest.is_privileged() {
                "privileged"
            } else {
                "normal"
            },
            mode: "docker",
            container_name: instance
                .as_ref()
                .map(|i| i.container_name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| manifest.container_name()),
            base_url: instance.map(|i| i.base_url).filter(|u| !u.is_empty()),
        }
    }

    pub fn get_manifest(&self, name: &str) -> Result<Arc<Manifest>, ManagerError> {
        self.manifest(name)
    }

    pub fn security(&self, name: &str) -> Result<SecuritySummary, ManagerError> {
        Ok(self.manifest(name)?.security_summary())
    }

    fn deny(&self, name: &str, caller: &Caller, check: PolicyCheckResult) -> ManagerError {
        let violation = check.violation.unwrap_or_else(|| PolicyViolation {
            kind: super::policy::ViolationKind::AdminRequired,
            message: "denied".to_string(),
        });
        warn!(
            event = event_names::POLICY_DENIED,
            stage = %Stage::Policy,
            plugin = %name,
            user = %caller.username,
            kind = ?violation.kind,
            reason = %violation.message,
            "policy denied"
        );
        ManagerError::PolicyDenied(violation)
    }

    /// Enable a plugin: policy check, record the confirmation, start the
    /// container, then persist `enabled=true`.
    ///
    /// A missing confirmation is not an error; the result carries the prompt
    /// the user has to answer.
    pub async fn enable(&self, req: EnableRequest) -> Result<EnableResult, ManagerError> {
        let name = req.name.as_str();
        let _guard = self.lock_plugin(name).await;
        let manifest = self.manifest(name)?;
        let state = self.store.get(name);

        let check = self
            .policy
            .check_enable(&manifest, &state, req.caller.role, req.confirmation.as_ref());
        if check.requires_confirmation() {
            return Ok(EnableResult {
                success: false,
                message: check.reason().unwrap_or_default().to_string(),
                requires_confirmation: true,
                confirmation_prompt: check.confirmation_prompt,
            });
        }
        if !check.allowed {
            return Err(self.deny(name, &req.caller, check));
        }

        if let Some(confirmation) = req.confirmation.as_ref().filter(|c| c.explicit_approval) {
            let mut confirmation = confirmation.clone();
            confirmation.plugin_name = name.to_string();
            if confirmation.username.is_empty() {
                confirmation.username = req.caller.username.clone();
            }
            self.store
                .set_confirmed(name, &confirmation, &manifest.content_hash())?;
        }

        if let Err(e) = self
            .runtime
            .create_and_start(&manifest, &self.plugin_env(name))
            .await
        {
            warn!(
                event = event_names::PLUGIN_ENABLE_FAILED,
                stage = %Stage::Runtime,
                plugin = %name,
                error = %e,
                "failed to start plugin"
            );
            self.log_store(self.store.set_error(name, &e.to_string()));
            return Err(e.into());
        }

        self.store.set_enabled(name, true)?;
        self.log_store(self.store.clear_error(name));
        info!(
            event = event_names::PLUGIN_ENABLED,
            stage = %Stage::Policy,
            plugin = %name,
            user = %req.caller.username,
            risk = %manifest.risk,
            "plugin enabled"
        );
        Ok(EnableResult {
            success: true,
            message: format!("Plugin {} enabled successfully", name),
            requires_confirmation: false,
            confirmation_prompt: None,
        })
    }

    /// Disable a plugin. `enabled=false` is persisted even when stopping the
    /// container fails; the stop error is still returned.
    pub async fn disable(&self, name: &str, caller: &Caller) -> Result<(), ManagerError> {
        let _guard = self.lock_plugin(name).await;
        let manifest = self.manifest(name)?;
        let check = self.policy.check_disable(&manifest, caller.role);
        if !check.allowed {
            return Err(self.deny(name, caller, check));
        }

        let stopped = self.runtime.stop(name).await;
        self.store.set_enabled(name, false)?;
        stopped?;
        info!(
            event = event_names::PLUGIN_DISABLED,
            stage = %Stage::Runtime,
            plugin = %name,
            user = %caller.username,
            "plugin disabled"
        );
        Ok(())
    }

    /// Admin toggle. Enabling acknowledges the manifest's risk and every
    /// permission on the admin's behalf.
    pub async fn toggle(
        &self,
        name: &str,
        enabled: bool,
        caller: &Caller,
    ) -> Result<EnableResult, ManagerError> {
        if !caller.is_admin() {
            return Err(self.deny(
                name,
                caller,
                PolicyCheckResult {
                    allowed: false,
                    violation: Some(PolicyViolation {
                        kind: super::policy::ViolationKind::AdminRequired,
                        message: "Only administrators can toggle plugins".to_string(),
                    }),
                    confirmation_prompt: None,
                },
            ));
        }
        if !enabled {
            self.disable(name, caller).await?;
            return Ok(EnableResult {
                success: true,
                message: format!("Plugin {} disabled successfully", name),
                requires_confirmation: false,
                confirmation_prompt: None,
            });
        }

        let manifest = self.manifest(name)?;
        let confirmation = Confirmation {
            plugin_name: name.to_string(),
            username: caller.username.clone(),
            acknowledged_risk: manifest.risk.as_str().to_string(),
            acknowledged_permissions: manifest
                .permissions
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            acknowledged_docker_params: Vec::new(),
            explicit_approval: true,
            timestamp: Utc::now(),
        };
        self.enable(EnableRequest {
            name: name.to_string(),
            caller: caller.clone(),
            confirmation: Some(confirmation),
        })
        .await
    }

    /// Install only checks policy; images are pulled on first enable.
    pub fn install(&self, name: &str, caller: &Caller) -> Result<InstallResult, ManagerError> {
        let manifest = self.manifest(name)?;
        let check = self.policy.check_install(&manifest, caller.role);
        if !check.allowed {
            return Err(self.deny(name, caller, check));
        }
        let instructions = manifest
            .lifecycle
            .as_ref()
            .and_then(|l| l.install.as_ref())
            .map(|phase| hook_instructions(&phase.hooks, name))
            .unwrap_or_default();
        info!(
            event = event_names::PLUGIN_INSTALLED,
            stage = %Stage::Policy,
            plugin = %name,
            user = %caller.username,
            manual_steps = instructions.len(),
            "plugin installed"
        );
        Ok(InstallResult {
            success: true,
            message: "Plugin is ready. Use enable to start the container.".to_string(),
            errors: Vec::new(),
            instructions,
        })
    }

    /// Stop and remove the container and its anonymous volumes, then clear
    /// `enabled`. With `remove_data` the state row is deleted as well.
    ///
    /// Transient and not-found removal errors are logged and tolerated.
    pub async fn uninstall(
        &self,
        name: &str,
        caller: &Caller,
        remove_data: bool,
    ) -> Result<InstallResult, ManagerError> {
        let _guard = self.lock_plugin(name).await;
        let manifest = self.manifest(name)?;
        let check = self.policy.check_uninstall(&manifest, caller.role);
        if !check.allowed {
            return Err(self.deny(name, caller, check));
        }

        if let Err(e) = self.runtime.stop(name).await {
            warn!(stage = %Stage::Runtime, plugin = %name, error = %e, "stop before uninstall failed");
        }
        if let Err(e) = self
            .runtime
            .remove(name, &manifest.container_name(), true)
            .await
        {
            let tolerated = e
                .docker_error()
                .is_some_and(|d| d.is_not_found() || d.retryable);
            if !tolerated {
                return Err(e.into());
            }
            warn!(stage = %Stage::Runtime, plugin = %name, error = %e, "failed to remove container, continuing");
        }

        if remove_data {
            self.store.remove(name)?;
        } else {
            self.store.set_enabled(name, false)?;
        }

        let instructions = manifest
            .lifecycle
            .as_ref()
            .and_then(|l| l.uninstall.as_ref())
            .map(|phase| hook_instructions(&phase.hooks, name))
            .unwrap_or_default();
        info!(
            event = event_names::PLUGIN_UNINSTALLED,
            stage = %Stage::Runtime,
            plugin = %name,
            user = %caller.username,
            remove_data,
            "plugin uninstalled"
        );
        Ok(InstallResult {
            success: true,
            message: format!("Plugin {} uninstalled successfully", name),
            errors: Vec::new(),
            instructions,
        })
    }

    /// One pass of desired-vs-actual comparison.
    ///
    /// Starts every enabled and confirmed plugin that is not running, then
    /// stops running instances whose plugin is no longer enabled. Failures
    /// are recorded per plugin and never abort the pass.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if let Err(e) = self.runtime.sync_state().await {
            warn!(stage = %Stage::Reconcile, error = %e, "sync before reconcile failed");
        }

        let expected = self.store.expected_running();
        for name in &expected {
            let _guard = self.lock_plugin(name).await;
            if self.runtime.is_running(name) {
                continue;
            }
            let Some(manifest) = self.registry.get(name) else {
                continue;
            };
            match self
                .runtime
                .create_and_start(&manifest, &self.plugin_env(name))
                .await
            {
                Ok(_) => {
                    self.store.record_reconcile_success(name);
                    report.started.push(name.clone());
                }
                Err(e) => {
                    warn!(stage = %Stage::Reconcile, plugin = %name, error = %e, "reconcile failed to start plugin");
                    self.store.record_reconcile_error(name, &e.to_string());
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        for instance in self.runtime.list_instances() {
            let name = instance.name.as_str();
            if !instance.is_running() || expected.iter().any(|n| n == name) {
                continue;
            }
            let _guard = self.lock_plugin(name).await;
            if self.store.is_enabled(name) {
                continue;
            }
            match self.runtime.stop(name).await {
                Ok(()) => {
                    self.store.record_reconcile_success(name);
                    report.stopped.push(name.to_string());
                }
                Err(e) => {
                    warn!(stage = %Stage::Reconcile, plugin = %name, error = %e, "reconcile failed to stop plugin");
                    self.store.record_reconcile_error(name, &e.to_string());
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        info!(
            event = event_names::RECONCILE_PASS,
            stage = %Stage::Reconcile,
            started = report.started.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "reconcile pass complete"
        );
        report
    }

    /// Run [`reconcile_once`](Self::reconcile_once) every `interval` until a
    /// shutdown message arrives. The first pass runs one interval after
    /// spawning.
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(stage = %Stage::Reconcile, "reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.reconcile_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MemoryDocker;
    use crate::plugin::policy::ViolationKind;
    use ok_common::Role;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        docker: Arc<MemoryDocker>,
        manager: PluginManager,
    }

    fn write_manifest(root: &std::path::Path, body: serde_json::Value) {
        let name = body["name"].as_str().unwrap().to_string();
        let dir = root.join("plugins").join(&name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), serde_json::to_vec(&body).unwrap()).unwrap();
    }

    fn fixture(manifests: &[serde_json::Value]) -> Fixture {
        let dir = TempDir::new().unwrap();
        for m in manifests {
            write_manifest(dir.path(), m.clone());
        }
        let docker = Arc::new(MemoryDocker::new());
        let manager = PluginManager::new(
            Registry::new(dir.path().join("plugins")),
            Store::open(dir.path().join("data/plugins-state.json"), None).unwrap(),
            PluginPolicy::default(),
            Runtime::new(docker.clone()),
        )
        .with_tokens(TokenAuthority::new(b"0123456789abcdef0123456789abcdef"));
        manager.registry().discover().unwrap();
        Fixture {
            _dir: dir,
            docker,
            manager,
        }
    }

    fn plugin(name: &str, risk: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "risk": risk,
            "permissions": ["net:local"],
            "docker": { "image": format!("{}:1", name), "port": 8080 }
        })
    }

    fn viewer() -> Caller {
        Caller {
            username: "val".into(),
            role: Role::Viewer,
        }
    }

    fn admin() -> Caller {
        Caller {
            username: "ada".into(),
            role: Role::Admin,
        }
    }

    fn approve(name: &str, caller: Caller, risk: &str) -> EnableRequest {
        EnableRequest {
            name: name.into(),
            caller,
            confirmation: Some(Confirmation {
                acknowledged_risk: risk.into(),
                acknowledged_permissions: vec!["net:local".into()],
                explicit_approval: true,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_enable_requires_then_accepts_confirmation() {
        let f = fixture(&[plugin("demo", "low")]);
        let first = f
            .manager
            .enable(EnableRequest {
                name: "demo".into(),
                caller: viewer(),
                confirmation: None,
            })
            .await
            .unwrap();
        assert!(first.requires_confirmation);
        assert!(first.confirmation_prompt.is_some());
        assert_eq!(f.docker.container_count(), 0);

        let second = f.manager.enable(approve("demo", viewer(), "low")).await.unwrap();
        assert!(second.success);
        let state = f.manager.store().get("demo");
        assert!(state.enabled && state.confirmed);
        assert_eq!(state.confirmed_by.as_deref(), Some("val"));

        let config = f.docker.create_config("opskernel-plugin-demo").unwrap();
        assert!(config.env.iter().any(|e| e.starts_with("MONITOR_TOKEN=")));
        assert!(config.env.contains(&"OPSKERNEL_PLUGIN_NAME=demo".to_string()));
    }

    #[tokio::test]
    async fn test_high_risk_needs_admin() {
        let f = fixture(&[plugin("risky", "high")]);
        let err = f
            .manager
            .enable(approve("risky", viewer(), "high"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Forbidden);
        assert!(f.manager.enable(approve("risky", admin(), "high")).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_enable_failure_records_error() {
        let f = fixture(&[plugin("demo", "low")]);
        f.docker.fail_next_starts(1);
        let err = f.manager.enable(approve("demo", viewer(), "low")).await.unwrap_err();
        assert!(err.retryable());
        let state = f.manager.store().get("demo");
        assert!(!state.enabled);
        assert!(state.last_error.is_some());
        assert_eq!(f.docker.container_count(), 0);
    }

    #[tokio::test]
    async fn test_disable_keeps_confirmation_and_sets_intent_on_failure() {
        let f = fixture(&[plugin("demo", "low")]);
        f.manager.enable(approve("demo", viewer(), "low")).await.unwrap();

        f.docker.set_read_only(true);
        let err = f.manager.disable("demo", &viewer()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::DockerReadonly);
        let state = f.manager.store().get("demo");
        assert!(!state.enabled);
        assert!(state.confirmed);

        f.docker.set_read_only(false);
        f.manager.disable("demo", &viewer()).await.unwrap();
        assert!(!f.manager.runtime().is_running("demo"));

        // Re-enable needs no new confirmation.
        let again = f
            .manager
            .enable(EnableRequest {
                name: "demo".into(),
                caller: viewer(),
                confirmation: None,
            })
            .await
            .unwrap();
        assert!(again.success);
    }

    #[tokio::test]
    async fn test_migrated_plugin_reenables_without_prompt() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), plugin("demo", "medium"));
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let legacy = data.join("plugins-enabled.json");
        std::fs::write(&legacy, br#"{"demo": true}"#).unwrap();

        let docker = Arc::new(MemoryDocker::new());
        let manager = PluginManager::new(
            Registry::new(dir.path().join("plugins")),
            Store::open(data.join("plugins-state.json"), Some(&legacy)).unwrap(),
            PluginPolicy::default(),
            Runtime::new(docker.clone()),
        );
        manager.load().await.unwrap();
        assert!(manager.runtime().is_running("demo"));

        let hash = manager.registry().get("demo").unwrap().content_hash();
        assert_eq!(manager.store().get("demo").manifest_hash.as_deref(), Some(hash.as_str()));

        manager.disable("demo", &admin()).await.unwrap();
        let again = manager
            .enable(EnableRequest {
                name: "demo".into(),
                caller: admin(),
                confirmation: None,
            })
            .await
            .unwrap();
        assert!(again.success, "{}", again.message);
        assert!(!again.requires_confirmation);
    }

    #[tokio::test]
    async fn test_toggle_is_admin_only() {
        let f = fixture(&[plugin("demo", "medium")]);
        let err = f.manager.toggle("demo", true, &viewer()).await.unwrap_err();
        match err {
            ManagerError::PolicyDenied(v) => assert_eq!(v.kind, ViolationKind::AdminRequired),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.manager.toggle("demo", true, &admin()).await.unwrap().success);
        assert!(f.manager.runtime().is_running("demo"));
        assert!(f.manager.toggle("demo", false, &admin()).await.unwrap().success);
        assert!(!f.manager.store().is_enabled("demo"));
    }

    #[tokio::test]
    async fn test_list_filters_and_describes() {
        let mut secret = plugin("secret", "low");
        secret["adminOnly"] = true.into();
        let mut ui = plugin("dash", "low");
        ui["ui"] = serde_json::json!({ "path": "app/", "title": "Dash", "showInNav": true });
        let f = fixture(&[secret, ui]);

        let rows = f.manager.list(&viewer());
        assert_eq!(rows.len(), 1);
        let dash = &rows[0];
        assert_eq!(dash.proxy_url, "/plugins/dash/app/");
        assert_eq!(dash.nav_title.as_deref(), Some("Dash"));
        assert_eq!(dash.state, ContainerState::NotFound);
        assert_eq!(dash.kind, "normal");
        assert_eq!(dash.container_name, "opskernel-plugin-dash");

        let names: Vec<_> = f.manager.list(&admin()).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["dash", "secret"]);
    }

    #[tokio::test]
    async fn test_install_and_uninstall() {
        let mut m = plugin("demo", "low");
        m["lifecycle"] = serde_json::json!({
            "install": { "hooks": [{ "type": "ensure-user", "user": "demo" }] }
        });
        let f = fixture(&[m]);

        assert!(f.manager.install("demo", &viewer()).is_err());
        let installed = f.manager.install("demo", &admin()).unwrap();
        assert_eq!(installed.message, "Plugin is ready. Use enable to start the container.");
        assert_eq!(installed.instructions.len(), 1);

        f.manager.enable(approve("demo", admin(), "low")).await.unwrap();
        let result = f.manager.uninstall("demo", &admin(), false).await.unwrap();
        assert!(result.success);
        assert_eq!(f.docker.container_count(), 0);
        assert!(f.manager.store().contains("demo"));
        assert!(!f.manager.store().is_enabled("demo"));

        f.manager.uninstall("demo", &admin(), true).await.unwrap();
        assert!(!f.manager.store().contains("demo"));
    }

    #[tokio::test]
    async fn test_reconcile_restarts_and_stops() {
        let f = fixture(&[plugin("keep", "low"), plugin("drop", "low")]);
        f.manager.enable(approve("keep", viewer(), "low")).await.unwrap();
        f.manager.enable(approve("drop", viewer(), "low")).await.unwrap();

        f.docker.kill("opskernel-plugin-keep");
        // Intent changes without touching the container.
        f.manager.store().set_enabled("drop", false).unwrap();

        let report = f.manager.reconcile_once().await;
        assert_eq!(report.started, vec!["keep"]);
        assert_eq!(report.stopped, vec!["drop"]);
        assert!(f.manager.runtime().is_running("keep"));
        assert!(!f.manager.runtime().is_running("drop"));

        let again = f.manager.reconcile_once().await;
        assert_eq!(again, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_errors_are_tagged() {
        let f = fixture(&[plugin("demo", "low")]);
        f.manager.enable(approve("demo", viewer(), "low")).await.unwrap();
        f.docker.kill("opskernel-plugin-demo");
        f.docker.fail_next_starts(1);

        let report = f.manager.reconcile_once().await;
        assert_eq!(report.failed.len(), 1);
        let state = f.manager.store().get("demo");
        assert!(state.last_error.unwrap().starts_with("reconcile: "));

        f.manager.reconcile_once().await;
        assert!(f.manager.store().get("demo").last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_stops_on_shutdown() {
        let f = fixture(&[]);
        let manager = Arc::new(f.manager);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = manager.spawn_reconciler(Duration::from_secs(30), shutdown_rx);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(f.docker.call_count("list") >= 2);
        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }
}
