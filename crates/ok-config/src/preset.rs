//! Plugin policy presets.
//!
//! Provides the two process-wide policies:
//! - Default: confirmation required; critical and privileged plugins allowed
//!   for admins who confirm them
//! - Strict: confirmation required; critical and privileged plugins refused

use serde::{Deserialize, Serialize};
use std::fmt;

/// Available policy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    /// Confirmation required, every risk level available to admins
    #[default]
    Default,
    /// Confirmation required, critical-risk and privileged plugins refused
    Strict,
}

impl PolicyPreset {
    /// All available presets.
    pub const ALL: &'static [PolicyPreset] = &[PolicyPreset::Default, PolicyPreset::Strict];

    /// Get preset name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPreset::Default => "default",
            PolicyPreset::Strict => "strict",
        }
    }

    /// Parse preset name from string.
    pub fn parse(s: &str) -> Option<PolicyPreset> {
        match s.trim().to_lowercase().as_str() {
            "default" | "standard" | "" => Some(PolicyPreset::Default),
            "strict" | "hardened" | "locked" => Some(PolicyPreset::Strict),
            _ => None,
        }
    }

    /// Get a description of the preset.
    pub fn description(&self) -> &'static str {
        match self {
            PolicyPreset::Default => {
                "Explicit confirmation required; critical and privileged plugins allowed for admins"
            }
            PolicyPreset::Strict => {
                "Explicit confirmation required; critical-risk and privileged plugins refused"
            }
        }
    }

    /// The policy switches this preset stands for.
    pub fn flags(&self) -> PolicyFlags {
        match self {
            PolicyPreset::Default => PolicyFlags {
                require_confirmation: true,
                allow_critical_risk: true,
                allow_privileged: true,
            },
            PolicyPreset::Strict => PolicyFlags {
                require_confirmation: true,
                allow_critical_risk: false,
                allow_privileged: false,
            },
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PolicyPreset {
    type Err = PresetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyPreset::parse(s).ok_or_else(|| PresetError::UnknownPreset(s.to_string()))
    }
}

/// Policy switches consulted by the plugin policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFlags {
    pub require_confirmation: bool,
    pub allow_critical_risk: bool,
    pub allow_privileged: bool,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        PolicyPreset::Default.flags()
    }
}

/// Errors related to preset selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetError {
    /// Unknown preset name.
    UnknownPreset(String),
}

impl fmt::Display for PresetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresetError::UnknownPreset(name) => {
                write!(
                    f,
                    "Unknown policy preset '{}'. Available: {}",
                    name,
                    PolicyPreset::ALL
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        }
    }
}

impl std::error::Error for PresetError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(PolicyPreset::parse("default"), Some(PolicyPreset::Default));
        assert_eq!(PolicyPreset::parse("STRICT"), Some(PolicyPreset::Strict));
        assert_eq!(PolicyPreset::parse("hardened"), Some(PolicyPreset::Strict));
        assert_eq!(PolicyPreset::parse("lax"), None);
    }

    #[test]
    fn test_default_flags() {
        let flags = PolicyPreset::Default.flags();
        assert!(flags.require_confirmation);
        assert!(flags.allow_critical_risk);
        assert!(flags.allow_privileged);
    }

    #[test]
    fn test_strict_flags() {
        let flags = PolicyPreset::Strict.flags();
        assert!(flags.require_confirmation);
        assert!(!flags.allow_critical_risk);
        assert!(!flags.allow_privileged);
    }

    #[test]
    fn test_unknown_preset_error_lists_available() {
        let err = "yolo".parse::<PolicyPreset>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("yolo"));
        assert!(msg.contains("default, strict"));
    }
}
