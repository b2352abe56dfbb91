//! Event names and subsystem stages attached to log records.

use serde::{Deserialize, Serialize};

/// Which part of the plugin subsystem emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Manifest discovery.
    Registry,
    /// Persisted state.
    Store,
    /// Enable/disable decisions.
    Policy,
    /// Container lifecycle.
    Runtime,
    /// Reverse proxy.
    Gateway,
    /// Background expected-vs-actual pass.
    Reconcile,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Registry => "registry",
            Stage::Store => "store",
            Stage::Policy => "policy",
            Stage::Runtime => "runtime",
            Stage::Gateway => "gateway",
            Stage::Reconcile => "reconcile",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Agent lifecycle
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPING: &str = "agent.stopping";

    // Registry
    pub const PLUGIN_DISCOVERED: &str = "plugin.discovered";
    pub const PLUGIN_SKIPPED: &str = "plugin.skipped";
    pub const PLUGIN_DEPRECATED_FORMAT: &str = "plugin.deprecated_format";

    // Manager
    pub const PLUGIN_ENABLED: &str = "plugin.enabled";
    pub const PLUGIN_ENABLE_FAILED: &str = "plugin.enable_failed";
    pub const PLUGIN_DISABLED: &str = "plugin.disabled";
    pub const PLUGIN_INSTALLED: &str = "plugin.installed";
    pub const PLUGIN_UNINSTALLED: &str = "plugin.uninstalled";
    pub const POLICY_DENIED: &str = "policy.denied";

    // Runtime
    pub const CONTAINER_STARTED: &str = "container.started";
    pub const CONTAINER_STOPPED: &str = "container.stopped";
    pub const CONTAINER_RECLAIMED: &str = "container.reclaimed";
    pub const CONTAINER_VANISHED: &str = "container.vanished";
    pub const DOCKER_RETRY: &str = "docker.retry";

    // Reconcile
    pub const RECONCILE_PASS: &str = "reconcile.pass";

    // Gateway
    pub const GATEWAY_WS_CONNECT: &str = "gateway.ws_connect";

    // Store
    pub const STATE_MIGRATED: &str = "state.migrated";
}
