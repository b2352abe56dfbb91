//! Typed Docker errors.
//!
//! Every Engine API call fails with a [`DockerError`] whose [`DockerErrorKind`]
//! is derived from the HTTP status (or from the transport failure). Callers
//! branch on the kind, never on message text.

use ok_common::ErrorCode;
use serde::Serialize;
use std::fmt;

/// Boxed transport or decode failure underneath a [`DockerError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a Docker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerErrorKind {
    /// 404: container, image, or network does not exist.
    NotFound,
    /// 409: name already in use, or container in a conflicting state.
    Conflict,
    /// 400: the daemon rejected the payload.
    BadRequest,
    /// 403: the daemon refused the operation.
    Forbidden,
    /// Mutations are disabled locally (`DOCKER_READ_ONLY`).
    ReadOnly,
    /// 5xx: daemon-side failure that may clear up.
    Temporary,
    /// No response within the request deadline.
    Timeout,
    /// Could not connect to the daemon at all.
    Unreachable,
    /// Anything else, including undecodable responses.
    Unknown,
}

impl DockerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerErrorKind::NotFound => "not_found",
            DockerErrorKind::Conflict => "conflict",
            DockerErrorKind::BadRequest => "bad_request",
            DockerErrorKind::Forbidden => "forbidden",
            DockerErrorKind::ReadOnly => "read_only",
            DockerErrorKind::Temporary => "temporary",
            DockerErrorKind::Timeout => "timeout",
            DockerErrorKind::Unreachable => "unreachable",
            DockerErrorKind::Unknown => "unknown",
        }
    }

    /// Map an HTTP status from the Engine API to a kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => DockerErrorKind::BadRequest,
            403 => DockerErrorKind::Forbidden,
            404 => DockerErrorKind::NotFound,
            409 => DockerErrorKind::Conflict,
            s if s >= 500 => DockerErrorKind::Temporary,
            _ => DockerErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DockerErrorKind::Temporary | DockerErrorKind::Timeout | DockerErrorKind::Unreachable
        )
    }

    /// Envelope code surfaced to HTTP clients.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DockerErrorKind::NotFound => ErrorCode::NotFound,
            DockerErrorKind::Conflict => ErrorCode::Conflict,
            DockerErrorKind::BadRequest => ErrorCode::BadRequest,
            DockerErrorKind::Forbidden => ErrorCode::Forbidden,
            DockerErrorKind::ReadOnly => ErrorCode::DockerReadonly,
            DockerErrorKind::Temporary | DockerErrorKind::Unreachable => {
                ErrorCode::DockerUnavailable
            }
            DockerErrorKind::Timeout => ErrorCode::DockerTimeout,
            DockerErrorKind::Unknown => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for DockerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed Docker call.
#[derive(Debug)]
pub struct DockerError {
    pub kind: DockerErrorKind,
    /// HTTP status, when the daemon answered.
    pub status_code: Option<u16>,
    pub message: String,
    /// Short operation name: `create`, `start`, `stop`, `inspect`, …
    pub operation: String,
    /// Container name or ID, image reference, or network.
    pub target: String,
    pub retryable: bool,
    pub cause: Option<BoxError>,
}

impl DockerError {
    pub fn new(
        kind: DockerErrorKind,
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            operation: operation.into(),
            target: target.into(),
            retryable: kind.is_retryable(),
            cause: None,
        }
    }

    /// Build an error from a non-success Engine API response.
    ///
    /// The daemon answers errors as `{"message": "..."}`; anything else is
    /// kept verbatim.
    pub fn from_status(operation: &str, target: &str, status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
        let message = if message.is_empty() {
            format!("HTTP {}", status)
        } else {
            message
        };
        let mut err = Self::new(DockerErrorKind::from_status(status), operation, target, message);
        err.status_code = Some(status);
        err
    }

    /// The daemon could not be reached.
    pub fn unreachable(operation: &str, target: &str, cause: impl Into<BoxError>) -> Self {
        Self::new(DockerErrorKind::Unreachable, operation, target, "connection failed")
            .with_cause(cause)
    }

    /// The request deadline elapsed.
    pub fn timeout(operation: &str, target: &str) -> Self {
        Self::new(DockerErrorKind::Timeout, operation, target, "request timed out")
    }

    /// Refused locally because mutations are disabled.
    pub fn read_only(operation: &str, target: &str) -> Self {
        Self::new(
            DockerErrorKind::ReadOnly,
            operation,
            target,
            "docker is in read-only mode",
        )
    }

    /// The daemon answered with something we could not decode.
    pub fn decode(operation: &str, target: &str, cause: impl Into<BoxError>) -> Self {
        Self::new(DockerErrorKind::Unknown, operation, target, "invalid response body")
            .with_cause(cause)
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == DockerErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == DockerErrorKind::Conflict
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "docker {} {}: {}", self.operation, self.target, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
