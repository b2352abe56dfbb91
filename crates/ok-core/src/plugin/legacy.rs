//! Adapter for the deprecated `plugin.json` format.

use super::hooks::{Lifecycle, LifecycleHook, LifecyclePhase};
use super::manifest::{
    DockerSpec, Manifest, ManifestError, ResourceLimits, SecurityConfig, UiSpec, VolumeMount,
};
use ok_common::{Permission, RiskLevel};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyPlugin {
    name: String,
    version: String,
    description: String,
    author: String,
    #[serde(rename = "type")]
    kind: String,
    risk: String,
    admin_only: bool,
    permissions: Vec<String>,
    container: LegacyContainer,
    ui: Option<LegacyUi>,
    install: Option<LegacyHooks>,
    uninstall: Option<LegacyHooks>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyContainer {
    image: String,
    port: i64,
    host_port: i64,
    container_name: String,
    env: BTreeMap<String, String>,
    network: String,
    volumes: Vec<LegacyVolume>,
    security: Option<LegacySecurity>,
    resources: Option<LegacyResources>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyVolume {
    #[serde(rename = "type")]
    kind: String,
    source: String,
    target: String,
    readonly: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacySecurity {
    privileged: bool,
    no_new_privileges: bool,
    read_only_rootfs: bool,
    cap_drop: Vec<String>,
    cap_add: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyResources {
    cpu: String,
    memory: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyUi {
    entry: String,
    icon: String,
    nav_title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyHooks {
    requires_approval: bool,
    hooks: Vec<LifecycleHook>,
}

impl LegacyHooks {
    fn into_phase(self) -> LifecyclePhase {
        LifecyclePhase {
            hooks: self.hooks,
            ..Default::default()
        }
    }
}

/// Parse `plugin.json` bytes into the flat model. Validation is left to the
/// caller.
pub fn parse_legacy(bytes: &[u8], path: &Path) -> Result<Manifest, ManifestError> {
    let legacy: LegacyPlugin =
        serde_json::from_slice(bytes).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let risk = RiskLevel::parse(&legacy.risk.to_lowercase()).unwrap_or(
        if legacy.kind == "privileged" {
            RiskLevel::High
        } else {
            RiskLevel::Low
        },
    );

    let permissions = legacy
        .permissions
        .iter()
        .map(|p| p.parse::<Permission>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ManifestError::Vocabulary {
            path: path.to_path_buf(),
            source,
        })?;

    let c = legacy.container;
    let docker = DockerSpec {
        image: c.image,
        port: c.port,
        host_port: u16::try_from(c.host_port).ok().filter(|p| *p > 0),
        container_name: c.container_name,
        env: c.env,
        network: c.network,
        volumes: c
            .volumes
            .into_iter()
            .map(|v| VolumeMount {
                kind: v.kind,
                source: v.source,
                target: v.target,
                read_only: v.readonly,
            })
            .collect(),
        security: c.security.map(|s| SecurityConfig {
            privileged: s.privileged,
            no_new_privileges: s.no_new_privileges,
            read_only_rootfs: s.read_only_rootfs,
            cap_drop: s.cap_drop,
            cap_add: s.cap_add,
            ..Default::default()
        }),
        resources: c.resources.map(|r| ResourceLimits {
            cpus: r.cpu,
            memory: r.memory,
            ..Default::default()
        }),
        ..Default::default()
    };

    let ui = legacy.ui.map(|ui| UiSpec {
        path: ui.entry,
        icon: ui.icon,
        title: ui.nav_title,
        show_in_nav: true,
        sandbox: String::new(),
    });

    let needs_approval = legacy.install.as_ref().is_some_and(|i| i.requires_approval);
    let lifecycle = match (legacy.install, legacy.uninstall) {
        (None, None) => None,
        (install, uninstall) => Some(Lifecycle {
            install: install.map(|i| {
                let mut phase = i.into_phase();
                if needs_approval {
                    phase.confirm_message =
                        "This plugin requires manual host setup before it is enabled".to_string();
                }
                phase
            }),
            upgrade: None,
            uninstall: uninstall.map(LegacyHooks::into_phase),
        }),
    };

    Ok(Manifest {
        name: legacy.name,
        version: legacy.version,
        description: legacy.description,
        author: legacy.author,
        license: String::new(),
        homepage: String::new(),
        risk,
        permissions,
        admin_only: legacy.admin_only,
        docker,
        ui,
        health_check: None,
        tags: Vec::new(),
        category: String::new(),
        lifecycle,
    })
}
