//! OpsKernel plugin subsystem.
//!
//! This library provides:
//! - Manifest parsing and validation (flat, v2 and legacy `plugin.json`)
//! - Plugin discovery, persisted state and the enable policy
//! - The container runtime over a typed Docker driver
//! - The HTTP API and reverse-proxy gateway
//!
//! The binary entry point is in `main.rs`.

pub mod api;
pub mod auth;
pub mod docker;
pub mod exit_codes;
pub mod logging;
pub mod plugin;
pub mod runtime;
