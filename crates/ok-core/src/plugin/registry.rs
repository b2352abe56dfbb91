//! Manifest discovery.
//!
//! Each immediate subdirectory of the plugins root is one plugin. Bad
//! manifests are logged and skipped; they never block the others.

use super::manifest::{load_manifest, LoadedManifest, Manifest, ManifestSource};
use crate::logging::{event_names, Stage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read plugins directory {path}: {source}", path = .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A registered manifest.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub manifest: Arc<Manifest>,
    pub source: ManifestSource,
    pub path: PathBuf,
}

impl From<LoadedManifest> for RegistryEntry {
    fn from(loaded: LoadedManifest) -> Self {
        Self {
            manifest: Arc::new(loaded.manifest),
            source: loaded.source,
            path: loaded.path,
        }
    }
}

/// What one discovery pass found.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    /// Directory name and reason.
    pub skipped: Vec<(String, String)>,
    pub deprecated: Vec<String>,
}

/// Name → manifest map rebuilt by [`Registry::discover`].
#[derive(Debug)]
pub struct Registry {
    plugins_dir: PathBuf,
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Rescan the plugins root and replace the map.
    ///
    /// A missing root yields an empty registry. Subdirectories are visited in
    /// name order; the first valid manifest for a plugin name wins.
    pub fn discover(&self) -> Result<DiscoveryReport, RegistryError> {
        let mut report = DiscoveryReport::default();
        let mut found: BTreeMap<String, RegistryEntry> = BTreeMap::new();

        let read_dir = match std::fs::read_dir(&self.plugins_dir) {
            Ok(rd) => Some(rd),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(RegistryError::ReadDir {
                    path: self.plugins_dir.clone(),
                    source,
                })
            }
        };

        let mut dirs: Vec<PathBuf> = read_dir
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let loaded = match load_manifest(&dir) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(
                        event = event_names::PLUGIN_SKIPPED,
                        stage = %Stage::Registry,
                        dir = %dir_name,
                        error = %e,
                        "skipping plugin"
                    );
                    report.skipped.push((dir_name, e.to_string()));
                    continue;
                }
            };

            let name = loaded.manifest.name.clone();
            if let Some(existing) = found.get(&name) {
                let reason = format!(
                    "duplicate plugin name '{}' (already registered from {})",
                    name,
                    existing.path.display()
                );
                warn!(
                    event = event_names::PLUGIN_SKIPPED,
                    stage = %Stage::Registry,
                    dir = %dir_name,
                    plugin = %name,
                    "duplicate plugin name"
                );
                report.skipped.push((dir_name, reason));
                continue;
            }

            if loaded.is_deprecated() {
                warn!(
                    event = event_names::PLUGIN_DEPRECATED_FORMAT,
                    stage = %Stage::Registry,
                    plugin = %name,
                    "plugin uses deprecated plugin.json, migrate to manifest.json"
                );
                report.deprecated.push(name.clone());
            }
            info!(
                event = event_names::PLUGIN_DISCOVERED,
                stage = %Stage::Registry,
                plugin = %name,
                version = %loaded.manifest.version,
                risk = %loaded.manifest.risk,
                "registered plugin"
            );
            report.registered.push(name.clone());
            found.insert(name, loaded.into());
        }

        *self.write() = found;
        Ok(report)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RegistryEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, RegistryEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Manifest>> {
        self.read().get(name).map(|e| Arc::clone(&e.manifest))
    }

    pub fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.read().get(name).cloned()
    }

    /// All manifests, ordered by name.
    pub fn list(&self) -> Vec<Arc<Manifest>> {
        self.read().values().map(|e| Arc::clone(&e.manifest)).collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Whether the plugin was loaded from `plugin.json`.
    pub fn is_deprecated_format(&self, name: &str) -> bool {
        self.read()
            .get(name)
            .is_some_and(|e| e.source == ManifestSource::Legacy)
    }

    /// File the manifest was loaded from.
    pub fn source_path(&self, name: &str) -> Option<PathBuf> {
        self.read().get(name).map(|e| e.path.clone())
    }
}
