// Core data structures for the sandboxed execution environment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exit code reported for a command killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// How a host directory is exposed inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Overlay view: writes land in a discardable layer.
    ReadOnly,
    /// Bind mapping: writes reach the host directory.
    ReadWrite,
}

impl Permission {
    /// Docker bind mode suffix.
    pub fn bind_mode(&self) -> &'static str {
        match self {
            Permission::ReadOnly => "ro",
            Permission::ReadWrite => "rw",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ReadOnly => write!(f, "READ_ONLY"),
            Permission::ReadWrite => write!(f, "READ_WRITE"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = super::error::SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "READ_ONLY" | "RO" => Ok(Permission::ReadOnly),
            "READ_WRITE" | "RW" => Ok(Permission::ReadWrite),
            other => Err(super::error::SandboxError::Configuration(format!(
                "invalid permission mode '{}', expected READ_ONLY or READ_WRITE",
                other
            ))),
        }
    }
}

/// Environment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentState {
    Created,
    Running,
    Stopped,
    Removed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Created => "Created",
            EnvironmentState::Running => "Running",
            EnvironmentState::Stopped => "Stopped",
            EnvironmentState::Removed => "Removed",
        };
        f.write_str(s)
    }
}

/// One command the model asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    /// Overrides the sandbox-wide default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a single command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub(crate) fn timed_out(after: Duration, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Command timed out after {} seconds", after.as_secs_f64()),
            exit_code: TIMEOUT_EXIT_CODE,
            elapsed,
            timed_out: true,
        }
    }

    /// Text handed back to the model as the observation for this command.
    pub fn to_observation(&self) -> String {
        let mut out = String::new();
        if self.timed_out {
            out.push_str("TIMED OUT\n");
        }
        out.push_str(&format!("exit code: {}\n", self.exit_code));
        if self.stdout.is_empty() && self.stderr.is_empty() {
            out.push_str("(no output)");
            return out;
        }
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Snapshot of an environment for logs and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub id: String,
    pub state: EnvironmentState,
    pub container_id: Option<String>,
    pub mount_target: Option<String>,
    pub permission: Option<Permission>,
    pub installed_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_parse() {
        assert_eq!("read_only".parse::<Permission>().unwrap(), Permission::ReadOnly);
        assert_eq!("READ-WRITE".parse::<Permission>().unwrap(), Permission::ReadWrite);
        assert_eq!("rw".parse::<Permission>().unwrap(), Permission::ReadWrite);
        assert!("execute".parse::<Permission>().is_err());
    }

    #[test]
    fn test_permission_serde_uses_screaming_case() {
        let json = serde_json::to_string(&Permission::ReadOnly).unwrap();
        assert_eq!(json, "\"READ_ONLY\"");
    }

    #[test]
    fn test_observation_includes_streams() {
        let result = CommandResult {
            stdout: "a.txt\n".into(),
            stderr: "warning".into(),
            exit_code: 0,
            elapsed: Duration::from_millis(5),
            timed_out: false,
        };
        let obs = result.to_observation();
        assert!(obs.starts_with("exit code: 0\n"));
        assert!(obs.contains("stdout:\na.txt\n"));
        assert!(obs.contains("stderr:\nwarning"));
    }

    #[test]
    fn test_timed_out_result() {
        let r = CommandResult::timed_out(Duration::from_secs(2), Duration::from_secs(2));
        assert!(r.timed_out);
        assert_eq!(r.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!r.success());
        assert!(r.to_observation().starts_with("TIMED OUT"));
    }
}
