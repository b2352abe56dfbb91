//! Exit codes for the `opskernel` binary.
//!
//! Exit code ranges:
//! - 0-9: Outcomes of the command itself
//! - 10-19: Configuration errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

/// Exit codes for opskernel commands.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Ok = 0,

    /// Manifest failed validation
    ValidationFailed = 1,

    /// Invalid arguments
    Usage = 2,

    /// Manifest file missing or unreadable
    FileError = 3,

    /// Invalid or incomplete configuration
    ConfigError = 10,

    /// Internal error (bug - please report)
    InternalError = 20,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Ok
    }

    /// Check if this exit code is a configuration error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    /// Check if this exit code is an internal error (codes 20-29).
    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Ok => "OK",
            ExitCode::ValidationFailed => "ERR_VALIDATION",
            ExitCode::Usage => "ERR_USAGE",
            ExitCode::FileError => "ERR_FILE",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::InternalError => "ERR_INTERNAL",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
