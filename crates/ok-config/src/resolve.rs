//! Agent settings resolution.
//!
//! Resolution order: CLI arguments → environment variables → defaults.

use crate::preset::{PolicyPreset, PresetError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable names.
pub const ENV_PLUGINS_DIR: &str = "OPSKERNEL_PLUGINS_DIR";
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_PORT: &str = "PORT";
pub const ENV_POLICY: &str = "OPSKERNEL_PLUGIN_POLICY";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_RECONCILE_INTERVAL: &str = "OPSKERNEL_RECONCILE_INTERVAL_SECS";

/// Plugin manifests directory inside the agent container.
pub const DEFAULT_PLUGINS_DIR: &str = "/app/plugins";

/// State directory inside the agent container.
pub const DEFAULT_DATA_DIR: &str = "/data";

pub const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;

/// Shortest accepted JWT signing secret, in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Errors resolving agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Preset(#[from] PresetError),

    #[error("JWT_SECRET is required to sign and verify session tokens")]
    MissingJwtSecret,

    #[error("JWT_SECRET must be at least 32 bytes (got {len})")]
    WeakJwtSecret { len: usize },

    #[error("unsupported DOCKER_HOST '{0}' (use unix://, tcp:// or http://)")]
    UnsupportedDockerHost(String),
}

/// Where a setting came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// Values supplied on the command line; `None` defers to env and defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub plugins_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub policy: Option<String>,
    pub reconcile_interval_secs: Option<u64>,
}

/// Source of each resolved setting (for diagnostics).
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub plugins_dir: ConfigSource,
    pub data_dir: ConfigSource,
    pub port: ConfigSource,
    pub policy: ConfigSource,
    pub reconcile_interval: ConfigSource,
}

/// Fully resolved agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub plugins_dir: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
    pub policy: PolicyPreset,
    pub jwt_secret: Option<String>,
    pub reconcile_interval: Duration,
    pub sources: ConfigSources,
}

impl AgentConfig {
    /// Resolve settings from CLI overrides and the process environment.
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve settings using an explicit environment lookup.
    pub fn resolve_with<F>(overrides: &ConfigOverrides, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let mut sources = ConfigSources::default();

        let plugins_dir = pick(
            overrides.plugins_dir.clone(),
            env(ENV_PLUGINS_DIR).map(PathBuf::from),
            &mut sources.plugins_dir,
        )
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGINS_DIR));

        let data_dir = pick(
            overrides.data_dir.clone(),
            env(ENV_DATA_DIR).map(PathBuf::from),
            &mut sources.data_dir,
        )
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let env_port = env(ENV_PORT)
            .map(|v| parse_number::<u16>(ENV_PORT, &v))
            .transpose()?;
        let port = pick(overrides.port, env_port, &mut sources.port).unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_PORT.to_string(),
                value: "0".to_string(),
                reason: "port must be in 1-65535".to_string(),
            });
        }

        let policy = match pick(
            overrides.policy.clone(),
            env(ENV_POLICY),
            &mut sources.policy,
        ) {
            Some(name) => name.parse::<PolicyPreset>()?,
            None => PolicyPreset::Default,
        };

        let env_interval = env(ENV_RECONCILE_INTERVAL)
            .map(|v| parse_number::<u64>(ENV_RECONCILE_INTERVAL, &v))
            .transpose()?;
        let interval_secs = pick(
            overrides.reconcile_interval_secs,
            env_interval,
            &mut sources.reconcile_interval,
        )
        .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_RECONCILE_INTERVAL.to_string(),
                value: "0".to_string(),
                reason: "interval must be at least one second".to_string(),
            });
        }

        Ok(AgentConfig {
            plugins_dir,
            data_dir,
            port,
            policy,
            jwt_secret: env(ENV_JWT_SECRET),
            reconcile_interval: Duration::from_secs(interval_secs),
            sources,
        })
    }

    /// The signing secret, checked for presence and strength.
    pub fn require_jwt_secret(&self) -> Result<&str, ConfigError> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or(ConfigError::MissingJwtSecret)?;
        if secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::WeakJwtSecret { len: secret.len() });
        }
        Ok(secret)
    }

    /// Path of the persisted plugin state file.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("plugins-state.json")
    }

    /// Path of the pre-state-file `{name: bool}` map.
    pub fn legacy_enabled_file(&self) -> PathBuf {
        self.data_dir.join("plugins-enabled.json")
    }
}

fn pick<T>(cli: Option<T>, env: Option<T>, source: &mut ConfigSource) -> Option<T> {
    if cli.is_some() {
        *source = ConfigSource::CliArgument;
        return cli;
    }
    if env.is_some() {
        *source = ConfigSource::Environment;
        return env;
    }
    *source = ConfigSource::BuiltinDefault;
    None
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
