//! Docker Engine endpoint settings.
//!
//! Read from the same variables the Docker CLI honours:
//! - `DOCKER_HOST`: `unix:///path`, `tcp://host:port`, `http://host:port`,
//!   or a bare socket path (default `/var/run/docker.sock`)
//! - `DOCKER_API_VERSION`: pins the API version path prefix (`1.43` → `/v1.43`)
//! - `DOCKER_READ_ONLY`: `true` refuses every mutating call

use crate::resolve::ConfigError;
use std::path::PathBuf;

pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";
pub const ENV_DOCKER_API_VERSION: &str = "DOCKER_API_VERSION";
pub const ENV_DOCKER_READ_ONLY: &str = "DOCKER_READ_ONLY";

/// Default Docker daemon socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// How to reach the Docker daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Plain TCP, as `host:port`.
    Tcp(String),
}

impl Default for DockerEndpoint {
    fn default() -> Self {
        DockerEndpoint::Unix(PathBuf::from(DEFAULT_DOCKER_SOCKET))
    }
}

impl DockerEndpoint {
    /// Parse a `DOCKER_HOST` value.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(DockerEndpoint::default());
        }
        if let Some(path) = value.strip_prefix("unix://") {
            if path.is_empty() {
                return Ok(DockerEndpoint::default());
            }
            return Ok(DockerEndpoint::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = value
            .strip_prefix("tcp://")
            .or_else(|| value.strip_prefix("http://"))
        {
            let authority = rest.trim_end_matches('/');
            if authority.is_empty() {
                return Err(ConfigError::UnsupportedDockerHost(value.to_string()));
            }
            return Ok(DockerEndpoint::Tcp(authority.to_string()));
        }
        if value.starts_with('/') {
            return Ok(DockerEndpoint::Unix(PathBuf::from(value)));
        }
        Err(ConfigError::UnsupportedDockerHost(value.to_string()))
    }
}

impl std::fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerEndpoint::Tcp(authority) => write!(f, "tcp://{}", authority),
        }
    }
}

/// Resolved Docker driver settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerSettings {
    pub endpoint: DockerEndpoint,
    /// Normalised version with its `v` prefix, e.g. `v1.43`.
    pub api_version: Option<String>,
    pub read_only: bool,
}

impl DockerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings using an explicit environment lookup.
    pub fn from_lookup<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = match env(ENV_DOCKER_HOST) {
            Some(host) => DockerEndpoint::parse(&host)?,
            None => DockerEndpoint::default(),
        };

        let api_version = env(ENV_DOCKER_API_VERSION)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| if v.starts_with('v') { v } else { format!("v{}", v) });

        let read_only = env(ENV_DOCKER_READ_ONLY)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false);

        Ok(DockerSettings {
            endpoint,
            api_version,
            read_only,
        })
    }

    /// Path prefix prepended to every Engine API request.
    pub fn api_prefix(&self) -> String {
        match &self.api_version {
            Some(v) => format!("/{}", v),
            None => String::new(),
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unix_socket() {
        let settings = DockerSettings::from_lookup(|_| None).unwrap();
        assert_eq!(
            settings.endpoint,
            DockerEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(settings.api_prefix(), "");
        assert!(!settings.read_only);
    }

    #[test]
    fn test_parse_hosts() {
        assert_eq!(
            DockerEndpoint::parse("unix:///run/user/1000/docker.sock").unwrap(),
            DockerEndpoint::Unix(PathBuf::from("/run/user/1000/docker.sock"))
        );
        assert_eq!(
            DockerEndpoint::parse("tcp://10.0.0.5:2375").unwrap(),
            DockerEndpoint::Tcp("10.0.0.5:2375".to_string())
        );
        assert_eq!(
            DockerEndpoint::parse("http://localhost:2375/").unwrap(),
            DockerEndpoint::Tcp("localhost:2375".to_string())
        );
        assert_eq!(
            DockerEndpoint::parse("/var/run/alt.sock").unwrap(),
            DockerEndpoint::Unix(PathBuf::from("/var/run/alt.sock"))
        );
        assert!(DockerEndpoint::parse("https://remote:2376").is_err());
        assert!(DockerEndpoint::parse("ssh://host").is_err());
    }

    #[test]
    fn test_api_version_prefix() {
        let settings = DockerSettings::from_lookup(|k| {
            (k == ENV_DOCKER_API_VERSION).then(|| "1.43".to_string())
        })
        .unwrap();
        assert_eq!(settings.api_version.as_deref(), Some("v1.43"));
        assert_eq!(settings.api_prefix(), "/v1.43");
    }

    #[test]
    fn test_read_only_switch() {
        for (value, expected) in [("true", true), ("TRUE", true), ("1", true), ("false", false), ("yes", false)] {
            let settings = DockerSettings::from_lookup(|k| {
                (k == ENV_DOCKER_READ_ONLY).then(|| value.to_string())
            })
            .unwrap();
            assert_eq!(settings.read_only, expected, "DOCKER_READ_ONLY={value}");
        }
    }
}
