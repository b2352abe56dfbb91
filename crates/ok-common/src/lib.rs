//! OpsKernel common types shared by the configuration and core crates.
//!
//! This crate provides:
//! - The risk and permission vocabulary plugin manifests are written in
//! - Caller roles as seen by the policy engine
//! - Stable error codes for the plugin HTTP surface

pub mod error;
pub mod security;

pub use error::{ApiErrorBody, ErrorCode};
pub use security::{Permission, RiskLevel, Role, VocabularyError};
