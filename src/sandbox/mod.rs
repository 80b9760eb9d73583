// Sandbox Module
//
// Isolated container environments: mount planning, container lifecycle,
// file transfer and command execution with per-command deadlines.

pub mod config;
pub mod docker;
pub mod error;
pub mod executor;
pub mod manager;
pub mod mount;
pub mod runtime;
pub mod shell;
pub mod transfer;
pub mod types;

// Re-export commonly used types
pub use config::{parse_size, SandboxSettings, DEFAULT_IMAGE};
pub use docker::DockerRuntime;
pub use error::{ErrorSeverity, Result, SandboxError};
pub use executor::CommandExecutor;
pub use manager::{Environment, EnvironmentGuard, EnvironmentManager, BASE_CAPABILITIES, ENVIRONMENT_LABEL};
pub use mount::{MountController, MountSpec, ReadOnlyStrategy, WORKDIR};
pub use runtime::{CappedBuffer, ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, RuntimeError};
pub use types::*;
