// Runtime settings for sandbox environments

use super::error::{Result, SandboxError};
use super::mount::ReadOnlyStrategy;
use std::time::Duration;

/// Default base image: has bash, coreutils, procps and python.
pub const DEFAULT_IMAGE: &str = "mcr.microsoft.com/devcontainers/python:3.11";

/// Settings shared by every environment one manager creates
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    pub image: String,
    /// Shell invocation prefix; the command text is appended as the last argument.
    pub shell: Vec<String>,
    pub network_enabled: bool,
    /// bytes
    pub max_memory: Option<u64>,
    /// CPU cores
    pub max_cpu: Option<f64>,
    /// Applied when a command carries no timeout of its own.
    pub command_timeout: Duration,
    /// Upper bound on the in-container kill after a command deadline.
    pub kill_grace: Duration,
    /// Passed to `docker stop` during teardown.
    pub stop_grace: Duration,
    /// Per-stream cap on output handed back to the model.
    pub max_output_bytes: usize,
    pub read_only_strategy: ReadOnlyStrategy,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            shell: vec!["/bin/bash".to_string(), "-lc".to_string()],
            network_enabled: true,
            max_memory: None,
            max_cpu: None,
            command_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            max_output_bytes: 64 * 1024,
            read_only_strategy: ReadOnlyStrategy::Overlay,
        }
    }
}

impl SandboxSettings {
    /// Validate resource limits and timeouts
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::Configuration("image must not be empty".to_string()));
        }
        if self.shell.is_empty() {
            return Err(SandboxError::Configuration("shell must not be empty".to_string()));
        }
        if let Some(memory) = self.max_memory {
            if memory < 128 * 1024 * 1024 {
                // minimum 128MB
                return Err(SandboxError::Configuration(
                    "max_memory must be at least 128M".to_string(),
                ));
            }
        }
        if let Some(cpu) = self.max_cpu {
            let num_cpus = num_cpus::get() as f64;
            if cpu <= 0.0 || cpu > num_cpus {
                return Err(SandboxError::Configuration(format!(
                    "max_cpu must be between 0 and {}",
                    num_cpus
                )));
            }
        }
        if self.command_timeout.is_zero() {
            return Err(SandboxError::Configuration(
                "command_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse size string (e.g., "2G", "512M")
pub fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();
    let (num_str, unit) = if size_str.ends_with('G') || size_str.ends_with('g') {
        (&size_str[..size_str.len() - 1], 1024 * 1024 * 1024)
    } else if size_str.ends_with('M') || size_str.ends_with('m') {
        (&size_str[..size_str.len() - 1], 1024 * 1024)
    } else if size_str.ends_with('K') || size_str.ends_with('k') {
        (&size_str[..size_str.len() - 1], 1024)
    } else {
        (size_str, 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| SandboxError::Configuration(format!("Invalid size: {}", size_str)))?;

    Ok(num * unit)
}
