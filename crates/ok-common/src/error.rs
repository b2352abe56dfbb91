//! Error codes for the plugin HTTP surface.
//!
//! Every failed plugin operation is reported to clients as a JSON envelope:
//! ```json
//! {
//!   "error": "docker start opskernel-plugin-demo: connection failed",
//!   "code": "docker_unavailable",
//!   "retryable": true,
//!   "details": { "plugin": "demo", "action": "enable" }
//! }
//! ```
//!
//! Codes are a stable contract for the frontend; adding one is fine,
//! renaming one is a breaking change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error code carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown plugin or container.
    NotFound,
    /// Container name clash that could not be recovered.
    Conflict,
    /// Admin required, or the active policy disallows the plugin.
    Forbidden,
    /// Malformed request payload.
    BadRequest,
    /// Docker daemon unreachable or failing with 5xx.
    DockerUnavailable,
    /// Docker call exceeded its deadline.
    DockerTimeout,
    /// Confirmation missing, incomplete, or mismatched.
    PolicyDenied,
    /// Unexpected failure inside the agent.
    InternalError,
    /// Docker mutations are disabled on this host.
    DockerReadonly,
}

impl ErrorCode {
    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::NotFound,
        ErrorCode::Conflict,
        ErrorCode::Forbidden,
        ErrorCode::BadRequest,
        ErrorCode::DockerUnavailable,
        ErrorCode::DockerTimeout,
        ErrorCode::PolicyDenied,
        ErrorCode::InternalError,
        ErrorCode::DockerReadonly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::DockerUnavailable => "docker_unavailable",
            ErrorCode::DockerTimeout => "docker_timeout",
            ErrorCode::PolicyDenied => "policy_denied",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::DockerReadonly => "docker_readonly",
        }
    }

    /// HTTP status the code is served with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::Forbidden | ErrorCode::PolicyDenied | ErrorCode::DockerReadonly => 403,
            ErrorCode::BadRequest => 400,
            ErrorCode::DockerUnavailable => 503,
            ErrorCode::DockerTimeout => 504,
            ErrorCode::InternalError => 500,
        }
    }

    /// Whether clients should retry by default when they see this code.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCode::DockerUnavailable | ErrorCode::DockerTimeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The serialized error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// Human-readable message.
    pub error: String,
    pub code: ErrorCode,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiErrorBody {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            retryable: code.retryable(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
