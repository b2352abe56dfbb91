//! Plugin subsystem: manifests, discovery, persisted state, policy and the
//! manager that drives them.

pub mod hooks;
pub mod legacy;
pub mod manager;
pub mod manifest;
pub mod manifest_v2;
pub mod policy;
pub mod registry;
pub mod store;

pub use manager::{EnableRequest, EnableResult, InstallResult, ManagerError, PluginManager, PluginSummary};
pub use manifest::{detect_manifest_version, load_manifest, LoadedManifest, Manifest, ManifestError, SecuritySummary, ValidationError, VersionCheckError};
pub use policy::{PluginPolicy, PolicyCheckResult, PolicyViolation, ViolationKind};
pub use registry::{DiscoveryReport, Registry, RegistryError};
pub use store::{Confirmation, PluginState, Store, StoreError};
