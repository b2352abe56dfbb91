//! Plugin manifest model, validation, and loading.
//!
//! The in-memory [`Manifest`] is the flat model every component works with.
//! On disk a plugin directory holds either a `manifest.json` (flat, or a
//! `manifestVersion: "2"` document converted by [`super::manifest_v2`]) or a
//! legacy `plugin.json` converted by [`super::legacy`].

use super::hooks::Lifecycle;
use ok_common::{Permission, RiskLevel, VocabularyError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LEGACY_MANIFEST_FILE: &str = "plugin.json";

/// Attached to registry entries loaded from `plugin.json`.
pub const DEPRECATION_WARNING: &str =
    "This plugin uses deprecated plugin.json format. Please migrate to manifest.json";

/// Default container name prefix.
pub const CONTAINER_NAME_PREFIX: &str = "opskernel-plugin-";

const RESTART_POLICIES: &[&str] = &["", "no", "always", "unless-stopped", "on-failure"];

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$").unwrap());

static MEMORY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[kmgKMG]?$").unwrap());

fn is_false(b: &bool) -> bool {
    !*b
}

/// A plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub admin_only: bool,
    pub docker: DockerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

/// How the plugin container is run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSpec {
    #[serde(default)]
    pub image: String,
    /// Port the plugin listens on inside the container.
    #[serde(default)]
    pub port: i64,
    /// Preferred loopback port, honoured when inside the host-port window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceMapping>,
    /// `bridge`, `host`, `none` or a custom network.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
    /// Size of /dev/shm, e.g. `256m`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shm_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// `bind` or `volume`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Host path for bind mounts, volume name otherwise.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMapping {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// e.g. `128m`, `1g`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory_reservation: String,
    /// Fractional CPUs, e.g. `0.5`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpus: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_shares: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pids_limit: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only_rootfs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_new_privileges: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub privileged: bool,
    /// `UID:GID` or a user name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

/// How the plugin appears in the web UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSpec {
    /// Entry path below the plugin's proxy root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub show_in_nav: bool,
    /// Iframe sandbox attributes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Expected status; 0 means 200.
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_period: String,
}

fn is_zero_u16(n: &u16) -> bool {
    *n == 0
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

impl HealthCheckSpec {
    pub fn expected_status(&self) -> u16 {
        if self.status_code == 0 {
            200
        } else {
            self.status_code
        }
    }

    /// Startup grace period, if it parses.
    pub fn start_period(&self) -> Option<Duration> {
        parse_duration(&self.start_period)
    }
}

/// Parse `500ms`, `10s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

/// One failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Field path, e.g. `docker.volumes[0].source`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors loading a manifest from disk.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest.json or plugin.json in {dir}", dir = .dir.display())]
    NotFound { dir: PathBuf },

    #[error("failed to read {path}: {source}", path = .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}", path = .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported manifestVersion '{version}' in {path}", path = .path.display())]
    UnsupportedVersion { path: PathBuf, version: String },

    #[error("{path}: {source}", path = .path.display())]
    Vocabulary {
        path: PathBuf,
        #[source]
        source: VocabularyError,
    },

    #[error("invalid manifest {path}: {errors}", path = .path.display(), errors = join_errors(.errors))]
    Invalid {
        path: PathBuf,
        errors: Vec<ValidationError>,
    },
}

impl ManifestError {
    /// Path of the offending file or directory.
    pub fn path(&self) -> &Path {
        match self {
            ManifestError::NotFound { dir } => dir,
            ManifestError::Io { path, .. }
            | ManifestError::Parse { path, .. }
            | ManifestError::UnsupportedVersion { path, .. }
            | ManifestError::Vocabulary { path, .. }
            | ManifestError::Invalid { path, .. } => path,
        }
    }
}

/// What `GET /api/plugins/security` returns; also the basis of the
/// confirmation prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySummary {
    pub risk: RiskLevel,
    pub permissions: Vec<Permission>,
    pub admin_only: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub docker_params: Vec<String>,
}

impl Manifest {
    /// Run every validation rule, collecting all failures.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn validation_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push(ValidationError::new("name", "plugin name is required"));
        } else if self.name.len() < 2 || self.name.len() > 64 {
            errors.push(ValidationError::new("name", "plugin name must be 2-64 characters"));
        } else if !NAME_PATTERN.is_match(&self.name) {
            errors.push(ValidationError::new(
                "name",
                "plugin name must be lowercase alphanumeric with hyphens, start with letter",
            ));
        }

        if self.version.is_empty() {
            errors.push(ValidationError::new("version", "plugin version is required"));
        }

        let docker = &self.docker;
        if docker.image.is_empty() {
            errors.push(ValidationError::new("docker.image", "docker.image is required"));
        }
        if docker.port <= 0 || docker.port > 65535 {
            errors.push(ValidationError::new(
                "docker.port",
                format!("invalid docker.port: {} (must be 1-65535)", docker.port),
            ));
        }

        for (i, v) in docker.volumes.iter().enumerate() {
            let path = format!("docker.volumes[{}]", i);
            if v.kind != "bind" && v.kind != "volume" {
                errors.push(ValidationError::new(
                    format!("{}.type", path),
                    format!("volume[{}]: type must be 'bind' or 'volume'", i),
                ));
            }
            if v.source.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.source", path),
                    format!("volume[{}]: source is required", i),
                ));
            }
            if v.target.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.target", path),
                    format!("volume[{}]: target is required", i),
                ));
            }
        }

        for (i, d) in docker.devices.iter().enumerate() {
            if d.host.is_empty() {
                errors.push(ValidationError::new(
                    format!("docker.devices[{}].host", i),
                    format!("device[{}]: host path is required", i),
                ));
            }
        }

        if !restart_policy_is_valid(&docker.restart_policy) {
            errors.push(ValidationError::new(
                "docker.restartPolicy",
                format!("invalid restart policy: {}", docker.restart_policy),
            ));
        }

        if let Some(resources) = &docker.resources {
            for (field, value) in [
                ("memory", &resources.memory),
                ("memoryReservation", &resources.memory_reservation),
            ] {
                if !value.is_empty() && !MEMORY_PATTERN.is_match(value) {
                    errors.push(ValidationError::new(
                        format!("docker.resources.{}", field),
                        format!("invalid {}: {} (expected e.g. 128m, 1g)", field, value),
                    ));
                }
            }
            if !resources.cpus.is_empty() && parse_cpus(&resources.cpus).is_none() {
                errors.push(ValidationError::new(
                    "docker.resources.cpus",
                    format!("invalid cpus: {} (expected a positive number)", resources.cpus),
                ));
            }
        }
        if !docker.shm_size.is_empty() && !MEMORY_PATTERN.is_match(&docker.shm_size) {
            errors.push(ValidationError::new(
                "docker.shmSize",
                format!("invalid shmSize: {} (expected e.g. 64m)", docker.shm_size),
            ));
        }

        if docker.network == "host" && !self.has_permission(Permission::HostNetwork) {
            errors.push(ValidationError::new(
                "permissions",
                "host network mode requires 'host:network' permission",
            ));
        }
        if self.is_privileged() && !self.has_permission(Permission::HostPrivilege) {
            errors.push(ValidationError::new(
                "permissions",
                "privileged container requires 'host:privilege' permission",
            ));
        }

        errors
    }

    /// The explicit container name, or `opskernel-plugin-{name}`.
    pub fn container_name(&self) -> String {
        if self.docker.container_name.is_empty() {
            format!("{}{}", CONTAINER_NAME_PREFIX, self.name)
        } else {
            self.docker.container_name.clone()
        }
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk.is_high()
    }

    pub fn is_privileged(&self) -> bool {
        self.docker.security.as_ref().is_some_and(|s| s.privileged)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn has_dangerous_permissions(&self) -> bool {
        self.permissions.iter().any(Permission::is_dangerous)
    }

    /// UI entry path, when one is declared.
    pub fn ui_path(&self) -> Option<&str> {
        self.ui
            .as_ref()
            .map(|ui| ui.path.as_str())
            .filter(|p| !p.is_empty() && *p != "/")
    }

    /// Lowercase hex SHA-256 of the canonical JSON form.
    ///
    /// Field order is fixed by the struct and maps are ordered, so equal
    /// manifests always hash equal.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn security_summary(&self) -> SecuritySummary {
        SecuritySummary {
            risk: self.risk,
            permissions: self.permissions.clone(),
            admin_only: self.admin_only,
            warnings: self.security_warnings(),
            docker_params: self.docker_params(),
        }
    }

    fn security_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let docker = &self.docker;
        if let Some(security) = &docker.security {
            if security.privileged {
                warnings.push("Runs in privileged mode (full host access)".to_string());
            }
            if !security.cap_add.is_empty() {
                warnings.push(format!("Adds capabilities: {}", security.cap_add.join(", ")));
            }
        }
        if docker.network == "host" {
            warnings.push("Uses host network (can see all network traffic)".to_string());
        }
        for v in &docker.volumes {
            if v.kind == "bind" && !v.read_only {
                warnings.push(format!("Writable bind mount: {}", v.source));
            }
        }
        if let Some(security) = &docker.security {
            let user = security.user.split(':').next().unwrap_or_default();
            if user == "root" || user == "0" {
                warnings.push("Runs as root user".to_string());
            }
        }
        warnings
    }

    /// Short `key: value` lines describing the container.
    pub fn docker_params(&self) -> Vec<String> {
        let docker = &self.docker;
        let mut params = vec![
            format!("image: {}", docker.image),
            format!("port: {}", docker.port),
        ];
        if !docker.network.is_empty() && docker.network != "bridge" {
            params.push(format!("network: {}", docker.network));
        }
        if let Some(resources) = &docker.resources {
            if !resources.memory.is_empty() {
                params.push(format!("memory: {}", resources.memory));
            }
            if !resources.cpus.is_empty() {
                params.push(format!("cpus: {}", resources.cpus));
            }
        }
        if !docker.volumes.is_empty() {
            params.push(format!("volumes: {} mounts", docker.volumes.len()));
        }
        if !docker.devices.is_empty() {
            params.push(format!("devices: {} mapped", docker.devices.len()));
        }
        params
    }
}

fn restart_policy_is_valid(policy: &str) -> bool {
    if RESTART_POLICIES.contains(&policy) {
        return true;
    }
    // on-failure:N
    policy
        .strip_prefix("on-failure:")
        .is_some_and(|n| n.parse::<u32>().is_ok())
}

/// Parse a memory string (`128m`, `1g`, `512k`, plain bytes) into bytes.
pub fn parse_memory(s: &str) -> Option<i64> {
    let s = s.trim();
    if !MEMORY_PATTERN.is_match(s) {
        return None;
    }
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

/// Parse a fractional CPU count; must be positive.
pub fn parse_cpus(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Which file a manifest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestSource {
    /// `manifest.json`, flat or v2.
    Manifest,
    /// `plugin.json`.
    Legacy,
}

/// A parsed and validated manifest plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub source: ManifestSource,
    pub path: PathBuf,
}

impl LoadedManifest {
    pub fn is_deprecated(&self) -> bool {
        self.source == ManifestSource::Legacy
    }

    pub fn deprecation_warning(&self) -> Option<&'static str> {
        self.is_deprecated().then_some(DEPRECATION_WARNING)
    }
}

/// Load and validate the manifest in a plugin directory.
///
/// `manifest.json` wins over `plugin.json` when both exist.
pub fn load_manifest(dir: &Path) -> Result<LoadedManifest, ManifestError> {
    let primary = dir.join(MANIFEST_FILE);
    let (path, source) = if primary.is_file() {
        (primary, ManifestSource::Manifest)
    } else {
        let legacy = dir.join(LEGACY_MANIFEST_FILE);
        if !legacy.is_file() {
            return Err(ManifestError::NotFound {
                dir: dir.to_path_buf(),
            });
        }
        (legacy, ManifestSource::Legacy)
    };

    let bytes = std::fs::read(&path).map_err(|source| ManifestError::Io {
        path: path.clone(),
        source,
    })?;
    let manifest = match source {
        ManifestSource::Manifest => parse_manifest(&bytes, &path)?,
        ManifestSource::Legacy => super::legacy::parse_legacy(&bytes, &path)?,
    };
    manifest.validate().map_err(|errors| ManifestError::Invalid {
        path: path.clone(),
        errors,
    })?;

    Ok(LoadedManifest {
        manifest,
        source,
        path,
    })
}

/// Parse `manifest.json` bytes, dispatching on `manifestVersion`.
///
/// Absent, empty, or `"1"` is the flat model; `"2"` is the v2 document.
/// Validation is left to the caller.
pub fn parse_manifest(bytes: &[u8], path: &Path) -> Result<Manifest, ManifestError> {
    let parse_err = |source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(parse_err)?;
    let version = match value.get("manifestVersion") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    match version.as_str() {
        "" | "1" => serde_json::from_value(value).map_err(parse_err),
        "2" => {
            let doc: super::manifest_v2::ManifestV2 =
                serde_json::from_value(value).map_err(parse_err)?;
            Ok(doc.into_manifest())
        }
        _ => Err(ManifestError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        }),
    }
}

/// Why a plugin directory's manifest version could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheckError {
    NotFound,
    Read,
    Parse,
}

impl VersionCheckError {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionCheckError::NotFound => "not-found",
            VersionCheckError::Read => "read-error",
            VersionCheckError::Parse => "parse-error",
        }
    }
}

impl std::fmt::Display for VersionCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct VersionField {
    #[serde(default, rename = "manifestVersion")]
    manifest_version: Option<String>,
}

/// Manifest version of a plugin directory, without validating the rest.
///
/// Absent, empty and `"1"` all report `"1"`; any other string is returned
/// as written.
pub fn detect_manifest_version(dir: &Path) -> Result<String, VersionCheckError> {
    let primary = dir.join(MANIFEST_FILE);
    let path = if primary.is_file() {
        primary
    } else {
        let legacy = dir.join(LEGACY_MANIFEST_FILE);
        if !legacy.is_file() {
            return Err(VersionCheckError::NotFound);
        }
        legacy
    };
    let bytes = std::fs::read(&path).map_err(|_| VersionCheckError::Read)?;
    let field: VersionField =
        serde_json::from_slice(&bytes).map_err(|_| VersionCheckError::Parse)?;
    Ok(match field.manifest_version.as_deref() {
        None | Some("") | Some("1") => "1".to_string(),
        Some(other) => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_manifest_version() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_manifest_version(dir.path()), Err(VersionCheckError::NotFound));

        let legacy = dir.path().join(LEGACY_MANIFEST_FILE);
        std::fs::write(&legacy, br#"{"name": "old"}"#).unwrap();
        assert_eq!(detect_manifest_version(dir.path()).unwrap(), "1");

        let primary = dir.path().join(MANIFEST_FILE);
        for (body, expected) in [
            (r#"{"manifestVersion": "2"}"#, "2"),
            (r#"{"manifestVersion": "1"}"#, "1"),
            (r#"{"manifestVersion": ""}"#, "1"),
            (r#"{"manifestVersion": "3-beta"}"#, "3-beta"),
        ] {
            std::fs::write(&primary, body).unwrap();
            assert_eq!(detect_manifest_version(dir.path()).unwrap(), expected, "{}", body);
        }

        std::fs::write(&primary, b"{not json").unwrap();
        assert_eq!(detect_manifest_version(dir.path()), Err(VersionCheckError::Parse));
        std::fs::write(&primary, br#"{"manifestVersion": 2}"#).unwrap();
        assert_eq!(
            detect_manifest_version(dir.path()).unwrap_err().as_str(),
            "parse-error"
        );
    }

    fn demo() -> Manifest {
        serde_json::from_value(serde_json::json!({
            "name": "demo",
            "version": "1.0.0",
            "risk": "low",
            "docker": { "image": "demo:latest", "port": 8080 }
        }))
        .unwrap()
    }

    fn messages(m: &Manifest) -> Vec<String> {
        m.validation_errors().into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn test_minimal_manifest_is_valid() {
        let m = demo();
        assert!(m.validate().is_ok());
        assert_eq!(m.container_name(), "opskernel-plugin-demo");
        assert!(!m.is_high_risk());
    }

    #[test]
    fn test_risk_is_required() {
        let err = serde_json::from_value::<Manifest>(serde_json::json!({
            "name": "demo", "version": "1", "docker": { "image": "x", "port": 1 }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("risk"));
    }

    #[test]
    fn test_unknown_permission_rejected_unknown_key_ignored() {
        let bad = serde_json::from_value::<Manifest>(serde_json::json!({
            "name": "demo", "version": "1", "risk": "low",
            "permissions": ["host:everything"],
            "docker": { "image": "x", "port": 1 }
        }));
        assert!(bad.is_err());

        let ok = serde_json::from_value::<Manifest>(serde_json::json!({
            "name": "demo", "version": "1", "risk": "low",
            "futureKey": { "nested": true },
            "docker": { "image": "x", "port": 1, "futureDockerKey": 3 }
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_name_rules() {
        let mut m = demo();
        m.name = String::new();
        assert_eq!(messages(&m), vec!["plugin name is required"]);
        m.name = "a".into();
        assert_eq!(messages(&m), vec!["plugin name must be 2-64 characters"]);
        m.name = "Demo".into();
        assert_eq!(
            messages(&m),
            vec!["plugin name must be lowercase alphanumeric with hyphens, start with letter"]
        );
        m.name = "demo-".into();
        assert_eq!(messages(&m).len(), 1);
        m.name = "web-shell2".into();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_errors_are_collected() {
        let mut m = demo();
        m.version.clear();
        m.docker.image.clear();
        m.docker.port = 70000;
        m.docker.volumes.push(VolumeMount {
            kind: "tmpfs".into(),
            ..Default::default()
        });
        let msgs = messages(&m);
        assert_eq!(
            msgs,
            vec![
                "plugin version is required",
                "docker.image is required",
                "invalid docker.port: 70000 (must be 1-65535)",
                "volume[0]: type must be 'bind' or 'volume'",
                "volume[0]: source is required",
                "volume[0]: target is required",
            ]
        );
    }

    #[test]
    fn test_host_network_and_privileged_need_permissions() {
        let mut m = demo();
        m.docker.network = "host".into();
        m.docker.security = Some(SecurityConfig {
            privileged: true,
            ..Default::default()
        });
        assert_eq!(
            messages(&m),
            vec![
                "host network mode requires 'host:network' permission",
                "privileged container requires 'host:privilege' permission",
            ]
        );
        m.permissions = vec![Permission::HostNetwork, Permission::HostPrivilege];
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_resource_and_restart_rules() {
        let mut m = demo();
        m.docker.restart_policy = "sometimes".into();
        m.docker.resources = Some(ResourceLimits {
            memory: "lots".into(),
            cpus: "-1".into(),
            ..Default::default()
        });
        m.docker.devices.push(DeviceMapping::default());
        assert_eq!(m.validation_errors().len(), 4);

        m.docker.restart_policy = "on-failure:3".into();
        m.docker.resources = Some(ResourceLimits {
            memory: "256M".into(),
            cpus: "0.5".into(),
            ..Default::default()
        });
        m.docker.devices[0].host = "/dev/ttyUSB0".into();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_parse_memory_and_cpus() {
        assert_eq!(parse_memory("512"), Some(512));
        assert_eq!(parse_memory("2k"), Some(2048));
        assert_eq!(parse_memory("128m"), Some(128 * 1024 * 1024));
        assert_eq!(parse_memory("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("1.5g"), None);
        assert_eq!(parse_cpus("0.25"), Some(0.25));
        assert_eq!(parse_cpus("0"), None);
        assert_eq!(parse_cpus("abc"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_security_summary() {
        let mut m = demo();
        m.permissions = vec![Permission::HostNetwork, Permission::HostPrivilege];
        m.docker.network = "host".into();
        m.docker.security = Some(SecurityConfig {
            privileged: true,
            cap_add: vec!["NET_ADMIN".into(), "SYS_TIME".into()],
            user: "0:0".into(),
            ..Default::default()
        });
        m.docker.volumes = vec![
            VolumeMount {
                kind: "bind".into(),
                source: "/etc".into(),
                target: "/host/etc".into(),
                read_only: true,
            },
            VolumeMount {
                kind: "bind".into(),
                source: "/var/log".into(),
                target: "/logs".into(),
                read_only: false,
            },
        ];
        m.docker.resources = Some(ResourceLimits {
            memory: "128m".into(),
            ..Default::default()
        });

        let summary = m.security_summary();
        assert_eq!(
            summary.warnings,
            vec![
                "Runs in privileged mode (full host access)",
                "Adds capabilities: NET_ADMIN, SYS_TIME",
                "Uses host network (can see all network traffic)",
                "Writable bind mount: /var/log",
                "Runs as root user",
            ]
        );
        assert_eq!(
            summary.docker_params,
            vec![
                "image: demo:latest",
                "port: 8080",
                "network: host",
                "memory: 128m",
                "volumes: 2 mounts",
            ]
        );
    }

    #[test]
    fn test_content_hash_tracks_changes() {
        let a = demo();
        let mut b = demo();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
        b.docker.env.insert("A".into(), "1".into());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_json_round_trip() {
        let mut m = demo();
        m.description = "Demo".into();
        m.permissions = vec![Permission::DataRead];
        m.ui = Some(UiSpec {
            path: "/app".into(),
            title: "Demo".into(),
            show_in_nav: true,
            ..Default::default()
        });
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.ui_path(), Some("/app"));
    }

    #[test]
    fn test_load_prefers_manifest_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&demo()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join(LEGACY_MANIFEST_FILE), b"{not json").unwrap();

        let loaded = load_manifest(dir.path()).unwrap();
        assert_eq!(loaded.source, ManifestSource::Manifest);
        assert!(loaded.deprecation_warning().is_none());
        assert_eq!(loaded.manifest.name, "demo");
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(ManifestError::NotFound { .. })
        ));

        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            br#"{"manifestVersion":"3","name":"demo"}"#,
        )
        .unwrap();
        match load_manifest(dir.path()) {
            Err(ManifestError::UnsupportedVersion { version, .. }) => assert_eq!(version, "3"),
            other => panic!("expected unsupported version, got {:?}", other),
        }

        let mut m = demo();
        m.docker.port = 0;
        std::fs::write(dir.path().join(MANIFEST_FILE), serde_json::to_vec(&m).unwrap()).unwrap();
        let err = load_manifest(dir.path()).unwrap_err();
        assert!(err.to_string().contains("invalid docker.port: 0"));
        assert_eq!(err.path(), dir.path().join(MANIFEST_FILE));
    }
}
