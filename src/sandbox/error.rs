// Error types for the sandboxed execution environment

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main sandbox error type
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Invalid mount path, unparsable model id, bad permission mode.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested mount escapes the approved root.
    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Environment provisioning failed: {0}")]
    Provision(String),

    #[error("Invalid environment state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Environment lost: {0}")]
    EnvironmentLost(String),

    /// The runtime rejected a request but the container is still there.
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Tool installation failed for '{tool}': {reason}")]
    ToolInstallation { tool: String, reason: String },

    #[error("Cancelled {0}")]
    Cancelled(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Stable error code, used in logs and in the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Configuration(_) => "CONFIGURATION_ERROR",
            SandboxError::Permission(_) => "PERMISSION_ERROR",
            SandboxError::Provision(_) => "ENVIRONMENT_PROVISION_ERROR",
            SandboxError::InvalidState { .. } => "INVALID_STATE",
            SandboxError::EnvironmentLost(_) => "ENVIRONMENT_LOST",
            SandboxError::Runtime(_) => "RUNTIME_ERROR",
            SandboxError::ToolInstallation { .. } => "TOOL_INSTALLATION_ERROR",
            SandboxError::Cancelled(_) => "CANCELLED",
            SandboxError::Teardown(_) => "TEARDOWN_FAILED",
            SandboxError::Io(_) => "IO_ERROR",
            SandboxError::Json(_) => "JSON_ERROR",
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SandboxError::Permission(_) => ErrorSeverity::Critical,
            SandboxError::EnvironmentLost(_) => ErrorSeverity::Critical,
            SandboxError::Teardown(_) => ErrorSeverity::Critical,
            SandboxError::Provision(_) => ErrorSeverity::Error,
            SandboxError::ToolInstallation { .. } => ErrorSeverity::Error,
            SandboxError::Configuration(_) => ErrorSeverity::Error,
            SandboxError::Runtime(_) => ErrorSeverity::Error,
            SandboxError::Io(_) => ErrorSeverity::Error,
            SandboxError::InvalidState { .. } => ErrorSeverity::Warning,
            SandboxError::Cancelled(_) => ErrorSeverity::Warning,
            SandboxError::Json(_) => ErrorSeverity::Warning,
        }
    }
}

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Critical error requiring immediate attention
    Critical,
    /// Error that prevents normal operation
    Error,
    /// Warning that may lead to errors
    Warning,
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
