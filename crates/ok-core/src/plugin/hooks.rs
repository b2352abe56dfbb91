//! Lifecycle hooks and their rendering as manual setup steps.
//!
//! Hooks are never executed by the agent. Host-level setup a plugin asks for
//! (system users, SSH keys, directories) is turned into instructions the
//! operator runs by hand.

use super::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// One declared hook. Field usage depends on `kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHook {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// Hooks and operator-facing text for one lifecycle phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePhase {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<LifecycleHook>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confirm_message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preserve_data: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<LifecyclePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<LifecyclePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<LifecyclePhase>,
}

/// A manual step shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInstruction {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl HookInstruction {
    fn new(kind: &str, description: String) -> Self {
        Self {
            kind: kind.to_string(),
            description,
            command: None,
            warning: None,
        }
    }

    fn command(mut self, command: String) -> Self {
        self.command = Some(command);
        self
    }

    fn warning(mut self, warning: &str) -> Self {
        self.warning = Some(warning.to_string());
        self
    }
}

/// Render hooks as instructions, in declaration order.
pub fn hook_instructions(hooks: &[LifecycleHook], plugin: &str) -> Vec<HookInstruction> {
    hooks.iter().map(|hook| render_hook(hook, plugin)).collect()
}

fn render_hook(hook: &LifecycleHook, plugin: &str) -> HookInstruction {
    let kind = hook.kind.as_str();
    match kind {
        "ensure-user" => {
            let shell = or_default(&hook.shell, "/bin/bash");
            HookInstruction::new(
                kind,
                format!("Create system user '{}' for plugin {}", hook.user, plugin),
            )
            .command(format!(
                "sudo useradd --system --shell {} --home /home/{} --create-home {}",
                shell, hook.user, hook.user
            ))
            .warning("This creates a system user on the host. Only run if you trust this plugin.")
        }
        "generate-ssh-key" => {
            let algorithm = or_default(&hook.algorithm, "ed25519");
            HookInstruction::new(kind, format!("Generate SSH key for plugin {}", plugin))
                .command(format!(
                    "sudo ssh-keygen -t {} -f {} -N '' -C 'opskernel-plugin-{}'",
                    algorithm, hook.key_path, plugin
                ))
                .warning("This generates SSH keys on the host.")
        }
        "authorize-key" => HookInstruction::new(
            kind,
            format!("Add plugin's public key to user '{}' authorized_keys", hook.user),
        )
        .command(format!(
            "sudo cat {} >> /home/{}/.ssh/authorized_keys",
            hook.key_path, hook.user
        ))
        .warning("This allows the plugin to SSH as this user."),
        "remove-authorized-key" => HookInstruction::new(
            kind,
            format!("Remove plugin's public key from user '{}' authorized_keys", hook.user),
        )
        .command(format!(
            "# Edit /home/{}/.ssh/authorized_keys and remove the line containing 'opskernel-plugin-{}'",
            hook.user, plugin
        )),
        "create-directory" => {
            let mode = or_default(&hook.mode, "755");
            HookInstruction::new(kind, format!("Create directory {}", hook.path))
                .command(format!("sudo mkdir -p -m {} {}", mode, hook.path))
        }
        "write-config" => HookInstruction::new(kind, format!("Write configuration to {}", hook.path))
            .command(format!(
                "# Create/edit {} with the plugin's required configuration",
                hook.path
            ))
            .warning("Review the configuration content before writing."),
        "remove-file" => HookInstruction::new(kind, format!("Remove file {}", hook.path))
            .command(format!("sudo rm -f {}", hook.path))
            .warning("Ensure this file is no longer needed before removing."),
        _ => HookInstruction::new(kind, format!("Unknown hook type: {}", hook.kind))
            .warning("This hook type is not recognized. Manual intervention required."),
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Markdown guide summarising what a plugin needs from the host.
pub fn manual_setup_guide(manifest: &Manifest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Manual Setup Instructions for {}\n", manifest.name);

    if manifest.is_high_risk() {
        out.push_str("WARNING: This plugin has elevated risk level.\n");
        out.push_str("Review all instructions carefully before proceeding.\n\n");
    }

    out.push_str("## Important Notice\n\n");
    out.push_str("OpsKernel does not execute host commands.\n");
    out.push_str("If this plugin requires host-level setup (like creating users or SSH keys),\n");
    out.push_str("you must perform these steps manually.\n\n");

    if !manifest.permissions.is_empty() {
        out.push_str("## Required Permissions\n\n");
        for p in &manifest.permissions {
            let _ = writeln!(out, "- {}", p);
        }
        out.push('\n');
    }

    let docker = &manifest.docker;
    out.push_str("## Container Configuration\n\n");
    let _ = writeln!(out, "- Image: {}", docker.image);
    let _ = writeln!(out, "- Internal Port: {}", docker.port);
    if !docker.network.is_empty() {
        let _ = writeln!(out, "- Network: {}", docker.network);
    }
    if !docker.volumes.is_empty() {
        out.push_str("- Volumes:\n");
        for v in &docker.volumes {
            let mode = if v.read_only { "ro" } else { "rw" };
            let _ = writeln!(out, "  - {} -> {} ({})", v.source, v.target, mode);
        }
    }
    out.push('\n');

    if let Some(security) = &docker.security {
        out.push_str("## Security Notes\n\n");
        if security.privileged {
            out.push_str("This container runs in PRIVILEGED mode with full host access.\n");
        }
        if !security.cap_add.is_empty() {
            let _ = writeln!(out, "- Added capabilities: {}", security.cap_add.join(", "));
        }
        out.push('\n');
    }

    out
}
