//! Plugin policy engine.
//!
//! Decides whether a caller may enable, disable, install or uninstall a
//! plugin. The engine is pure: it reads the manifest, the persisted state and
//! the caller's confirmation, and never touches Docker or the store.
//!
//! ```text
//! request → PluginPolicy::check_* → (allow | violation | confirmation prompt)
//! ```

use super::manifest::Manifest;
use super::store::{Confirmation, PluginState};
use ok_common::{ErrorCode, Permission, RiskLevel, Role};
use ok_config::{PolicyFlags, PolicyPreset};
use serde::Serialize;

/// Categories of policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Plugin is admin-only and the caller is not an admin.
    AdminRequired,
    /// Critical-risk plugins are disabled by the active preset.
    CriticalRiskDisallowed,
    /// Privileged containers are disabled by the active preset.
    PrivilegedDisallowed,
    /// High and critical plugins need an admin.
    HighRiskRequiresAdmin,
    /// No explicit approval was supplied.
    ConfirmationRequired,
    /// Approval was supplied but does not match the manifest.
    InvalidConfirmation,
}

impl ViolationKind {
    /// Envelope code used when the violation is returned as an error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ViolationKind::ConfirmationRequired | ViolationKind::InvalidConfirmation => {
                ErrorCode::PolicyDenied
            }
            _ => ErrorCode::Forbidden,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub message: String,
}

impl PolicyViolation {
    fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the UI must show before the user can approve a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPrompt {
    pub risk: RiskLevel,
    pub permissions: Vec<Permission>,
    pub docker_params: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfirmationPrompt {
    pub fn for_manifest(manifest: &Manifest) -> Self {
        let summary = manifest.security_summary();
        Self {
            risk: summary.risk,
            permissions: summary.permissions,
            docker_params: summary.docker_params,
            warnings: summary.warnings,
        }
    }
}

/// Result of a policy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCheckResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<PolicyViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_prompt: Option<ConfirmationPrompt>,
}

impl PolicyCheckResult {
    fn allowed() -> Self {
        Self {
            allowed: true,
            violation: None,
            confirmation_prompt: None,
        }
    }

    fn blocked(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            violation: Some(PolicyViolation::new(kind, message)),
            confirmation_prompt: None,
        }
    }

    fn needs_confirmation(manifest: &Manifest) -> Self {
        Self {
            allowed: false,
            violation: Some(PolicyViolation::new(
                ViolationKind::ConfirmationRequired,
                "Explicit confirmation required to enable this plugin",
            )),
            confirmation_prompt: Some(ConfirmationPrompt::for_manifest(manifest)),
        }
    }

    pub fn requires_confirmation(&self) -> bool {
        self.violation
            .as_ref()
            .is_some_and(|v| v.kind == ViolationKind::ConfirmationRequired)
    }

    pub fn reason(&self) -> Option<&str> {
        self.violation.as_ref().map(|v| v.message.as_str())
    }
}

/// Process-wide policy, built from a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginPolicy {
    flags: PolicyFlags,
}

impl Default for PluginPolicy {
    fn default() -> Self {
        Self::from_preset(PolicyPreset::Default)
    }
}

impl PluginPolicy {
    pub fn new(flags: PolicyFlags) -> Self {
        Self { flags }
    }

    pub fn from_preset(preset: PolicyPreset) -> Self {
        Self::new(preset.flags())
    }

    pub fn flags(&self) -> PolicyFlags {
        self.flags
    }

    /// Decision table for enable. The first matching rule wins.
    pub fn check_enable(
        &self,
        manifest: &Manifest,
        state: &PluginState,
        role: Role,
        confirmation: Option<&Confirmation>,
    ) -> PolicyCheckResult {
        if manifest.admin_only && !role.is_admin() {
            return PolicyCheckResult::blocked(
                ViolationKind::AdminRequired,
                "This plugin requires admin privileges",
            );
        }
        if manifest.risk == RiskLevel::Critical && !self.flags.allow_critical_risk {
            return PolicyCheckResult::blocked(
                ViolationKind::CriticalRiskDisallowed,
                "Critical-risk plugins are not allowed by policy",
            );
        }
        if manifest.is_privileged() && !self.flags.allow_privileged {
            return PolicyCheckResult::blocked(
                ViolationKind::PrivilegedDisallowed,
                "Privileged containers are not allowed by policy",
            );
        }
        if manifest.risk.is_high() && !role.is_admin() {
            return PolicyCheckResult::blocked(
                ViolationKind::HighRiskRequiresAdmin,
                "High-risk plugins require admin privileges",
            );
        }
        if !self.flags.require_confirmation {
            return PolicyCheckResult::allowed();
        }
        if state.is_confirmed_for(&manifest.content_hash()) {
            return PolicyCheckResult::allowed();
        }

        let confirmation = match confirmation {
            Some(c) if c.explicit_approval => c,
            _ => return PolicyCheckResult::needs_confirmation(manifest),
        };
        match validate_confirmation(manifest, confirmation) {
            Ok(()) => PolicyCheckResult::allowed(),
            Err(message) => PolicyCheckResult::blocked(
                ViolationKind::InvalidConfirmation,
                format!("Invalid confirmation: {}", message),
            ),
        }
    }

    pub fn check_disable(&self, manifest: &Manifest, role: Role) -> PolicyCheckResult {
        if manifest.admin_only && !role.is_admin() {
            return PolicyCheckResult::blocked(
                ViolationKind::AdminRequired,
                "This plugin requires admin privileges to manage",
            );
        }
        PolicyCheckResult::allowed()
    }

    pub fn check_install(&self, manifest: &Manifest, role: Role) -> PolicyCheckResult {
        if !role.is_admin() {
            return PolicyCheckResult::blocked(
                ViolationKind::AdminRequired,
                "Only administrators can install plugins",
            );
        }
        if manifest.risk == RiskLevel::Critical && !self.flags.allow_critical_risk {
            return PolicyCheckResult::blocked(
                ViolationKind::CriticalRiskDisallowed,
                "Critical-risk plugins are not allowed by policy",
            );
        }
        PolicyCheckResult::allowed()
    }

    pub fn check_uninstall(&self, _manifest: &Manifest, role: Role) -> PolicyCheckResult {
        if !role.is_admin() {
            return PolicyCheckResult::blocked(
                ViolationKind::AdminRequired,
                "Only administrators can uninstall plugins",
            );
        }
        PolicyCheckResult::allowed()
    }
}

/// Risk must match exactly and every manifest permission must be
/// acknowledged. Extra acknowledgements are tolerated.
fn validate_confirmation(manifest: &Manifest, confirmation: &Confirmation) -> Result<(), String> {
    if confirmation.acknowledged_risk != manifest.risk.as_str() {
        return Err(format!(
            "acknowledged risk '{}' does not match manifest risk '{}'",
            confirmation.acknowledged_risk, manifest.risk
        ));
    }
    for permission in &manifest.permissions {
        let acked = confirmation
            .acknowledged_permissions
            .iter()
            .any(|a| a == permission.as_str());
        if !acked {
            return Err(format!("permission '{}' not acknowledged", permission));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::SecurityConfig;

    fn manifest(risk: RiskLevel, permissions: &[Permission]) -> Manifest {
        serde_json::from_value(serde_json::json!({
            "name": "demo",
            "version": "1.0.0",
            "risk": risk,
            "permissions": permissions,
            "docker": { "image": "demo:1", "port": 8080 }
        }))
        .unwrap()
    }

    fn approval(risk: &str, permissions: &[&str]) -> Confirmation {
        Confirmation {
            plugin_name: "demo".into(),
            username: "alice".into(),
            acknowledged_risk: risk.into(),
            acknowledged_permissions: permissions.iter().map(|p| p.to_string()).collect(),
            explicit_approval: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_confirmation_returns_prompt() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Low, &[]);
        let result = policy.check_enable(&m, &PluginState::default(), Role::Viewer, None);
        assert!(!result.allowed);
        assert!(result.requires_confirmation());
        let prompt = result.confirmation_prompt.unwrap();
        assert_eq!(prompt.risk, RiskLevel::Low);
        assert!(prompt.warnings.is_empty());
        assert!(prompt.docker_params.contains(&"image: demo:1".to_string()));
    }

    #[test]
    fn test_approval_without_explicit_flag_is_not_enough() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Low, &[]);
        let mut c = approval("low", &[]);
        c.explicit_approval = false;
        let result = policy.check_enable(&m, &PluginState::default(), Role::Viewer, Some(&c));
        assert!(result.requires_confirmation());
    }

    #[test]
    fn test_valid_confirmation_is_allowed_and_stable() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Medium, &[Permission::NetLocal]);
        let c = approval("medium", &["net:local", "fs:read"]);
        let state = PluginState::default();
        let first = policy.check_enable(&m, &state, Role::Viewer, Some(&c));
        let second = policy.check_enable(&m, &state, Role::Viewer, Some(&c));
        assert!(first.allowed);
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_confirmation_kinds() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Medium, &[Permission::NetLocal, Permission::DataRead]);
        let state = PluginState::default();

        let wrong_risk = approval("low", &["net:local", "data:read"]);
        let r = policy.check_enable(&m, &state, Role::Viewer, Some(&wrong_risk));
        assert_eq!(r.violation.as_ref().unwrap().kind, ViolationKind::InvalidConfirmation);
        assert!(r.reason().unwrap().contains("does not match manifest risk 'medium'"));

        let missing = approval("medium", &["net:local"]);
        let r = policy.check_enable(&m, &state, Role::Viewer, Some(&missing));
        assert_eq!(r.reason(), Some("Invalid confirmation: permission 'data:read' not acknowledged"));
        assert_eq!(r.violation.unwrap().kind.error_code(), ErrorCode::PolicyDenied);
    }

    #[test]
    fn test_confirmed_state_needs_matching_hash() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Low, &[]);
        let mut state = PluginState {
            confirmed: true,
            manifest_hash: Some(m.content_hash()),
            ..Default::default()
        };
        assert!(policy.check_enable(&m, &state, Role::Viewer, None).allowed);

        state.manifest_hash = Some("stale".into());
        assert!(policy
            .check_enable(&m, &state, Role::Viewer, None)
            .requires_confirmation());
    }

    #[test]
    fn test_migrated_legacy_row_skips_prompt() {
        let dir = tempfile::TempDir::new().unwrap();
        let legacy = dir.path().join("plugins-enabled.json");
        std::fs::write(&legacy, br#"{"demo": true}"#).unwrap();
        let store =
            crate::plugin::Store::open(dir.path().join("plugins-state.json"), Some(&legacy))
                .unwrap();

        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Medium, &[Permission::NetLocal]);
        let result = policy.check_enable(&m, &store.get("demo"), Role::Admin, None);
        assert!(result.allowed, "{:?}", result.violation);
        assert!(!result.requires_confirmation());
    }

    #[test]
    fn test_rule_order() {
        let policy = PluginPolicy::from_preset(PolicyPreset::Strict);
        let mut m = manifest(RiskLevel::Critical, &[Permission::HostPrivilege]);
        m.admin_only = true;
        m.docker.security = Some(SecurityConfig {
            privileged: true,
            ..Default::default()
        });
        let state = PluginState::default();

        let r = policy.check_enable(&m, &state, Role::Viewer, None);
        assert_eq!(r.violation.unwrap().kind, ViolationKind::AdminRequired);

        let r = policy.check_enable(&m, &state, Role::Admin, None);
        assert_eq!(r.violation.unwrap().kind, ViolationKind::CriticalRiskDisallowed);

        m.risk = RiskLevel::High;
        let r = policy.check_enable(&m, &state, Role::Admin, None);
        assert_eq!(r.violation.unwrap().kind, ViolationKind::PrivilegedDisallowed);

        m.admin_only = false;
        m.docker.security = None;
        let r = policy.check_enable(&m, &state, Role::Viewer, None);
        assert_eq!(r.violation.unwrap().kind, ViolationKind::HighRiskRequiresAdmin);
        assert_eq!(
            ViolationKind::HighRiskRequiresAdmin.error_code(),
            ErrorCode::Forbidden
        );
    }

    #[test]
    fn test_default_preset_allows_critical_for_admin() {
        let policy = PluginPolicy::default();
        let m = manifest(RiskLevel::Critical, &[]);
        let c = approval("critical", &[]);
        let r = policy.check_enable(&m, &PluginState::default(), Role::Admin, Some(&c));
        assert!(r.allowed);
    }

    #[test]
    fn test_confirmation_can_be_turned_off() {
        let policy = PluginPolicy::new(PolicyFlags {
            require_confirmation: false,
            ..PolicyPreset::Default.flags()
        });
        let m = manifest(RiskLevel::Medium, &[Permission::NetLocal]);
        assert!(policy
            .check_enable(&m, &PluginState::default(), Role::Viewer, None)
            .allowed);
    }

    #[test]
    fn test_management_checks() {
        let policy = PluginPolicy::from_preset(PolicyPreset::Strict);
        let mut m = manifest(RiskLevel::Low, &[]);

        assert!(policy.check_disable(&m, Role::Viewer).allowed);
        m.admin_only = true;
        assert_eq!(
            policy.check_disable(&m, Role::Viewer).reason(),
            Some("This plugin requires admin privileges to manage")
        );

        assert_eq!(
            policy.check_install(&m, Role::Viewer).reason(),
            Some("Only administrators can install plugins")
        );
        assert!(policy.check_install(&m, Role::Admin).allowed);
        m.risk = RiskLevel::Critical;
        assert!(!policy.check_install(&m, Role::Admin).allowed);

        assert_eq!(
            policy.check_uninstall(&m, Role::Viewer).reason(),
            Some("Only administrators can uninstall plugins")
        );
        assert!(policy.check_uninstall(&m, Role::Admin).allowed);
    }
}
