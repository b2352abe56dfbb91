//! Risk levels, permissions, and roles.
//!
//! Manifests declare a risk level and a set of permissions drawn from a
//! closed vocabulary. Unknown permission strings are rejected when a manifest
//! is parsed; there is no "other" escape hatch.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors parsing the security vocabulary from strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VocabularyError {
    #[error("unknown risk level '{0}' (expected one of: low, medium, high, critical)")]
    UnknownRisk(String),

    #[error("unknown permission '{0}'")]
    UnknownPermission(String),
}

/// Declared risk of running a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// All risk levels, lowest first.
    pub const ALL: &'static [RiskLevel] = &[
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Parse a risk level; matching is exact (manifests are lowercase).
    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// High and critical plugins are gated behind the admin role.
    pub fn is_high(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = VocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RiskLevel::parse(s).ok_or_else(|| VocabularyError::UnknownRisk(s.to_string()))
    }
}

/// A host capability a plugin asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "host:network")]
    HostNetwork,
    #[serde(rename = "host:pid")]
    HostPid,
    #[serde(rename = "host:ipc")]
    HostIpc,
    #[serde(rename = "host:mount")]
    HostMount,
    #[serde(rename = "host:privilege")]
    HostPrivilege,
    #[serde(rename = "host:ssh")]
    HostSsh,
    #[serde(rename = "docker:socket")]
    DockerSocket,
    #[serde(rename = "docker:management")]
    DockerManagement,
    #[serde(rename = "data:read")]
    DataRead,
    #[serde(rename = "data:write")]
    DataWrite,
    #[serde(rename = "data:delete")]
    DataDelete,
    #[serde(rename = "net:local")]
    NetLocal,
    #[serde(rename = "net:internet")]
    NetInternet,
    #[serde(rename = "fs:read")]
    FsRead,
    #[serde(rename = "fs:write")]
    FsWrite,
    #[serde(rename = "user:root")]
    UserRoot,
    #[serde(rename = "gpu:access")]
    GpuAccess,
    #[serde(rename = "device:usb")]
    DeviceUsb,
}

impl Permission {
    pub const ALL: &'static [Permission] = &[
        Permission::HostNetwork,
        Permission::HostPid,
        Permission::HostIpc,
        Permission::HostMount,
        Permission::HostPrivilege,
        Permission::HostSsh,
        Permission::DockerSocket,
        Permission::DockerManagement,
        Permission::DataRead,
        Permission::DataWrite,
        Permission::DataDelete,
        Permission::NetLocal,
        Permission::NetInternet,
        Permission::FsRead,
        Permission::FsWrite,
        Permission::UserRoot,
        Permission::GpuAccess,
        Permission::DeviceUsb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::HostNetwork => "host:network",
            Permission::HostPid => "host:pid",
            Permission::HostIpc => "host:ipc",
            Permission::HostMount => "host:mount",
            Permission::HostPrivilege => "host:privilege",
            Permission::HostSsh => "host:ssh",
            Permission::DockerSocket => "docker:socket",
            Permission::DockerManagement => "docker:management",
            Permission::DataRead => "data:read",
            Permission::DataWrite => "data:write",
            Permission::DataDelete => "data:delete",
            Permission::NetLocal => "net:local",
            Permission::NetInternet => "net:internet",
            Permission::FsRead => "fs:read",
            Permission::FsWrite => "fs:write",
            Permission::UserRoot => "user:root",
            Permission::GpuAccess => "gpu:access",
            Permission::DeviceUsb => "device:usb",
        }
    }

    pub fn parse(s: &str) -> Option<Permission> {
        Permission::ALL.iter().copied().find(|p| p.as_str() == s)
    }

    /// Permissions that hand the plugin broad control over the host.
    pub fn is_dangerous(&self) -> bool {
        matches!(
            self,
            Permission::HostNetwork
                | Permission::HostPid
                | Permission::HostPrivilege
                | Permission::DockerSocket
                | Permission::UserRoot
        )
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = VocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::parse(s).ok_or_else(|| VocabularyError::UnknownPermission(s.to_string()))
    }
}

/// Role of the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Viewer,
}

impl Role {
    /// Anything other than `admin` is treated as a viewer.
    pub fn from_claim(s: &str) -> Role {
        if s.eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Viewer
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
