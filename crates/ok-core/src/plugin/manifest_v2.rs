//! `manifestVersion: "2"` documents.
//!
//! v2 groups fields into `metadata`, `security`, `container`, `api` and `ui`
//! sections. Documents are converted to the flat [`Manifest`] on load and
//! [`Manifest::to_v2`] converts back.

use super::hooks::Lifecycle;
use super::manifest::{
    DeviceMapping, DockerSpec, HealthCheckSpec, Manifest, ResourceLimits, SecurityConfig, UiSpec,
    VolumeMount,
};
use ok_common::{Permission, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_VERSION_V2: &str = "2";

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestV2 {
    #[serde(rename = "$schema", default, skip_serializing_if = "String::is_empty")]
    pub schema: String,
    pub manifest_version: String,
    pub metadata: MetadataV2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<RequirementsV2>,
    pub security: SecurityV2,
    pub container: ContainerV2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiV2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiV2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub i18n: BTreeMap<String, I18nEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataV2 {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsV2 {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_core_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    /// Plugin name → version requirement.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityV2 {
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "is_false")]
    pub admin_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_classification: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub audit_log: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerV2 {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// `http` (default) or `https`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMountV2>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceMapping>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shm_size: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

/// A mount; `hostPath` makes it a bind mount, `name` a named volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountV2 {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_path: String,
    #[serde(default)]
    pub container_path: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiV2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthEndpointV2>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketV2>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub openapi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsV2>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEndpointV2 {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub status_code: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketV2 {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsV2 {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiV2 {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub show_in_nav: bool,
    #[serde(default)]
    pub nav_order: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub theme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub width: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct I18nEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ManifestV2 {
    /// Convert to the flat model; sections with no flat counterpart are dropped.
    pub fn into_manifest(self) -> Manifest {
        let ManifestV2 {
            metadata,
            security,
            container,
            api,
            ui,
            lifecycle,
            ..
        } = self;

        let health_check = container.health_check.clone().or_else(|| {
            api.as_ref().and_then(|a| a.health.as_ref()).map(|h| HealthCheckSpec {
                path: h.path.clone(),
                status_code: h.status_code,
                ..Default::default()
            })
        });

        let entry = api.as_ref().map(|a| a.entry.clone()).unwrap_or_default();
        let ui = match ui {
            Some(ui) => Some(UiSpec {
                path: entry,
                icon: ui.icon,
                title: ui.title,
                show_in_nav: ui.show_in_nav,
                sandbox: ui.sandbox,
            }),
            None if !entry.is_empty() => Some(UiSpec {
                path: entry,
                ..Default::default()
            }),
            None => None,
        };

        Manifest {
            name: metadata.name,
            version: metadata.version,
            description: metadata.description,
            author: metadata.author,
            license: metadata.license,
            homepage: metadata.homepage,
            risk: security.risk,
            permissions: security.permissions,
            admin_only: security.admin_only,
            docker: DockerSpec {
                image: container.image,
                port: container.port,
                host_port: container.host_port,
                container_name: container.container_name,
                env: container.env,
                volumes: container.volumes.into_iter().map(VolumeMountV2::into_mount).collect(),
                devices: container.devices,
                network: container.network,
                resources: container.resources,
                security: container.security,
                extra_hosts: container.extra_hosts,
                working_dir: container.working_dir,
                entrypoint: container.entrypoint,
                command: container.command,
                labels: container.labels,
                restart_policy: container.restart_policy,
                shm_size: container.shm_size,
            },
            ui,
            health_check,
            tags: metadata.tags,
            category: metadata.category,
            lifecycle,
        }
    }
}

impl VolumeMountV2 {
    fn into_mount(self) -> VolumeMount {
        let (kind, source) = if !self.host_path.is_empty() {
            ("bind", self.host_path)
        } else if !self.name.is_empty() {
            ("volume", self.name)
        } else {
            ("", String::new())
        };
        VolumeMount {
            kind: kind.to_string(),
            source,
            target: self.container_path,
            read_only: self.read_only,
        }
    }

    fn from_mount(mount: &VolumeMount) -> Self {
        let mut v = VolumeMountV2 {
            container_path: mount.target.clone(),
            read_only: mount.read_only,
            ..Default::default()
        };
        match mount.kind.as_str() {
            "bind" => v.host_path = mount.source.clone(),
            _ => v.name = mount.source.clone(),
        }
        v
    }
}

impl Manifest {
    /// Express this manifest as a v2 document.
    ///
    /// `to_v2().into_manifest()` returns an equal manifest for every valid one.
    pub fn to_v2(&self) -> ManifestV2 {
        let docker = &self.docker;

        // The UI entry path lives in api.entry; a UI block with nothing but
        // a path is carried by the api section alone.
        let (ui, entry) = match &self.ui {
            Some(ui) => {
                let bare = ui.icon.is_empty()
                    && ui.title.is_empty()
                    && !ui.show_in_nav
                    && ui.sandbox.is_empty()
                    && !ui.path.is_empty();
                let v2 = (!bare).then(|| UiV2 {
                    title: ui.title.clone(),
                    icon: ui.icon.clone(),
                    show_in_nav: ui.show_in_nav,
                    sandbox: ui.sandbox.clone(),
                    ..Default::default()
                });
                (v2, ui.path.clone())
            }
            None => (None, String::new()),
        };
        let api = (!entry.is_empty()).then(|| ApiV2 {
            entry,
            ..Default::default()
        });

        ManifestV2 {
            schema: String::new(),
            manifest_version: MANIFEST_VERSION_V2.to_string(),
            metadata: MetadataV2 {
                name: self.name.clone(),
                version: self.version.clone(),
                description: self.description.clone(),
                author: self.author.clone(),
                license: self.license.clone(),
                homepage: self.homepage.clone(),
                tags: self.tags.clone(),
                category: self.category.clone(),
                ..Default::default()
            },
            requirements: None,
            security: SecurityV2 {
                risk: self.risk,
                admin_only: self.admin_only,
                permissions: self.permissions.clone(),
                data_classification: String::new(),
                audit_log: false,
            },
            container: ContainerV2 {
                image: docker.image.clone(),
                port: docker.port,
                host_port: docker.host_port,
                protocol: String::new(),
                container_name: docker.container_name.clone(),
                env: docker.env.clone(),
                volumes: docker.volumes.iter().map(VolumeMountV2::from_mount).collect(),
                devices: docker.devices.clone(),
                network: docker.network.clone(),
                resources: docker.resources.clone(),
                security: docker.security.clone(),
                shm_size: docker.shm_size.clone(),
                extra_hosts: docker.extra_hosts.clone(),
                working_dir: docker.working_dir.clone(),
                entrypoint: docker.entrypoint.clone(),
                command: docker.command.clone(),
                labels: docker.labels.clone(),
                restart_policy: docker.restart_policy.clone(),
                health_check: self.health_check.clone(),
            },
            api,
            ui,
            lifecycle: self.lifecycle.clone(),
            i18n: BTreeMap::new(),
        }
    }
}
