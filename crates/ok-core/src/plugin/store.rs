//! Persisted plugin state.
//!
//! One JSON object `{name: PluginState}` in a single file. Every mutation
//! updates the in-memory map and rewrites the whole file while holding the
//! store lock, so the file always reflects the order of successful writes.

use crate::logging::{event_names, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

/// Prefix that marks an error recorded by the reconcile loop.
pub const RECONCILE_ERROR_PREFIX: &str = "reconcile: ";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file {path}: {source}", path = .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}", path = .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {path}: {source}", path = .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize plugin state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to migrate legacy state {path}: {reason}", path = .path.display())]
    Migrate { path: PathBuf, reason: String },
}

/// Persisted user intent for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginState {
    /// User intent, not live running state.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_by: Option<String>,
    /// Hash of the manifest the confirmation was given for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
}

impl PluginState {
    /// A confirmation counts only while the manifest hash is unchanged.
    /// Rows migrated from the legacy map carry no hash and hold for the
    /// manifest present until [`Store::pin_confirmation`] records one.
    pub fn is_confirmed_for(&self, manifest_hash: &str) -> bool {
        self.confirmed
            && self
                .manifest_hash
                .as_deref()
                .is_none_or(|h| h == manifest_hash)
    }

    pub fn has_reconcile_error(&self) -> bool {
        self.last_error
            .as_deref()
            .is_some_and(|e| e.starts_with(RECONCILE_ERROR_PREFIX))
    }
}

/// A user's acknowledgement of a plugin's risk and permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub acknowledged_risk: String,
    #[serde(default)]
    pub acknowledged_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acknowledged_docker_params: Vec<String>,
    #[serde(default)]
    pub explicit_approval: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

type StateMap = BTreeMap<String, PluginState>;

/// File-backed plugin state.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    states: Mutex<StateMap>,
}

impl Store {
    /// Open the state file, starting empty when it does not exist.
    ///
    /// When the state file is absent and `legacy` names an existing
    /// `{name: bool}` map, every `true` entry becomes enabled and confirmed
    /// and the legacy file is renamed with a `.migrated` suffix. A corrupt
    /// state file is an error; it is never overwritten.
    pub fn open(path: impl Into<PathBuf>, legacy: Option<&Path>) -> Result<Self, StoreError> {
        let path = path.into();
        let existed = path.exists();
        let states = if existed {
            load_states(&path)?
        } else {
            StateMap::new()
        };
        let store = Store {
            path,
            states: Mutex::new(states),
        };
        if let (false, Some(legacy)) = (existed, legacy) {
            store.migrate_legacy(legacy)?;
        }
        Ok(store)
    }

    /// In-memory store that writes to `path` on first mutation.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Store {
            path: path.into(),
            states: Mutex::new(StateMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StateMap> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate_legacy(&self, legacy: &Path) -> Result<(), StoreError> {
        let bytes = match std::fs::read(legacy) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StoreError::Migrate {
                    path: legacy.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };
        let enabled: BTreeMap<String, bool> =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Migrate {
                path: legacy.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut states = self.lock();
        let mut migrated = 0usize;
        for (name, on) in enabled {
            let state = states.entry(name).or_default();
            state.enabled = on;
            if on {
                state.confirmed = true;
                migrated += 1;
            }
        }
        persist(&self.path, &states)?;
        drop(states);

        let mut target = legacy.as_os_str().to_owned();
        target.push(".migrated");
        std::fs::rename(legacy, &target).map_err(|e| StoreError::Migrate {
            path: legacy.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!(
            event = event_names::STATE_MIGRATED,
            stage = %Stage::Store,
            enabled = migrated,
            legacy = %legacy.display(),
            "migrated legacy plugin state"
        );
        Ok(())
    }

    /// Apply `f` to the plugin's row (created on demand), then persist.
    fn update<F>(&self, name: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PluginState),
    {
        let mut states = self.lock();
        f(states.entry(name.to_string()).or_default());
        persist(&self.path, &states)
    }

    /// Copy of the plugin's row; a default row when none exists.
    pub fn get(&self, name: &str) -> PluginState {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn set(&self, name: &str, state: PluginState) -> Result<(), StoreError> {
        self.update(name, |s| *s = state)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        self.update(name, |s| {
            s.enabled = enabled;
            if enabled {
                s.last_started_at = Some(Utc::now());
            }
        })
    }

    /// Record a confirmation against the manifest it was given for.
    pub fn set_confirmed(
        &self,
        name: &str,
        confirmation: &Confirmation,
        manifest_hash: &str,
    ) -> Result<(), StoreError> {
        self.update(name, |s| {
            s.confirmed = true;
            s.confirmed_at = Some(confirmation.timestamp);
            s.confirmed_by = Some(confirmation.username.clone());
            s.manifest_hash = Some(manifest_hash.to_string());
        })
    }

    /// Attach `manifest_hash` to a confirmation that has none. Returns
    /// whether the row changed.
    pub fn pin_confirmation(&self, name: &str, manifest_hash: &str) -> Result<bool, StoreError> {
        let mut states = self.lock();
        let Some(s) = states.get_mut(name) else {
            return Ok(false);
        };
        if !s.confirmed || s.manifest_hash.is_some() {
            return Ok(false);
        }
        s.manifest_hash = Some(manifest_hash.to_string());
        persist(&self.path, &states)?;
        Ok(true)
    }

    pub fn set_error(&self, name: &str, message: &str) -> Result<(), StoreError> {
        self.update(name, |s| {
            s.last_error = Some(message.to_string());
            s.last_error_at = Some(Utc::now());
        })
    }

    pub fn clear_error(&self, name: &str) -> Result<(), StoreError> {
        let mut states = self.lock();
        if let Some(s) = states.get_mut(name) {
            s.last_error = None;
            s.last_error_at = None;
        }
        persist(&self.path, &states)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|s| s.enabled)
    }

    pub fn is_confirmed(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|s| s.confirmed)
    }

    /// Names of enabled plugins, sorted.
    pub fn enabled_plugins(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Plugins the reconcile loop keeps running: enabled and confirmed.
    pub fn expected_running(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.enabled && s.confirmed)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn all_states(&self) -> BTreeMap<String, PluginState> {
        self.lock().clone()
    }

    /// Delete the plugin's row. Returns whether one existed.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut states = self.lock();
        let existed = states.remove(name).is_some();
        if existed {
            persist(&self.path, &states)?;
        }
        Ok(existed)
    }

    /// Record a reconcile failure. Write errors are logged, not returned.
    pub fn record_reconcile_error(&self, name: &str, error: &str) {
        let message = format!("{}{}", RECONCILE_ERROR_PREFIX, error);
        if let Err(e) = self.set_error(name, &message) {
            warn!(stage = %Stage::Store, plugin = %name, error = %e, "failed to persist reconcile error");
        }
    }

    /// Clear the error only when the reconcile loop recorded it.
    pub fn record_reconcile_success(&self, name: &str) {
        let mut states = self.lock();
        let Some(s) = states.get_mut(name) else {
            return;
        };
        if !s.has_reconcile_error() {
            return;
        }
        s.last_error = None;
        s.last_error_at = None;
        if let Err(e) = persist(&self.path, &states) {
            warn!(stage = %Stage::Store, plugin = %name, error = %e, "failed to persist reconcile success");
        }
    }
}

fn load_states(path: &Path) -> Result<StateMap, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StateMap::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the whole map via a temp file and rename.
fn persist(path: &Path, states: &StateMap) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(states)?;
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, &data).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).map_err(write_err)?;
    }
    std::fs::rename(&tmp, path).map_err(write_err)
}
