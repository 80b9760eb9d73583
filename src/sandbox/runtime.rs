// Container runtime abstraction used by the environment manager

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// What to create for one environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Docker bind strings (`src:dst:mode`).
    pub binds: Vec<String>,
    /// Paths to mount as private tmpfs.
    pub tmpfs: Vec<String>,
    pub network_enabled: bool,
    /// bytes
    pub memory: Option<u64>,
    /// CPU cores
    pub cpus: Option<f64>,
    /// Capabilities re-added after dropping all of them.
    pub cap_add: Vec<String>,
    pub labels: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

/// One process to run inside a started container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// Keep at most this many bytes of each stream; the rest is read and discarded.
    pub output_limit: Option<usize>,
}

/// Raw output of an exec that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
    /// Bytes discarded past `output_limit`.
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
}

/// Byte sink that keeps the first `limit` bytes and counts the rest.
#[derive(Debug, Clone, Default)]
pub struct CappedBuffer {
    data: Vec<u8>,
    limit: Option<usize>,
    dropped: usize,
}

impl CappedBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.data.len()),
            None => chunk.len(),
        };
        let keep = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }

    /// Kept bytes and the number discarded.
    pub fn into_parts(self) -> (Vec<u8>, usize) {
        (self.data, self.dropped)
    }
}

/// Errors reported by a container runtime
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The daemon could not be reached at all.
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    /// The container is missing or no longer running.
    #[error("container gone: {0}")]
    Gone(String),

    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// Whether this error means the sandbox can no longer be trusted to exist.
    pub fn is_environment_lost(&self) -> bool {
        matches!(self, RuntimeError::Unreachable(_) | RuntimeError::Gone(_))
    }
}

/// Container runtime abstraction
///
/// One runtime handle is created per process (it wraps the daemon
/// connection) and shared by every environment manager through an
/// `Arc<dyn ContainerRuntime>`. Implementations must be safe to call from
/// concurrent runs; they hold no per-environment state.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name used in logs ("docker", "fake", ...).
    fn name(&self) -> &str;

    /// Make sure `image` is present locally, pulling it when missing.
    ///
    /// # Errors
    ///
    /// Returns `ImageUnavailable` if the image cannot be obtained and
    /// `Unreachable` if the daemon cannot be contacted.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Run a process inside the container and wait for it to exit.
    ///
    /// No deadline is applied here; callers wrap this in their own timeout
    /// and are responsible for killing the process if they give up on it.
    async fn exec(&self, id: &str, exec: &ExecSpec) -> Result<ExecOutput, RuntimeError>;

    /// Unpack a tar `archive` into the existing directory `dest_dir` of the container.
    async fn upload(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<(), RuntimeError>;

    /// Fetch `path` from the container as a tar archive whose top entry is its base name.
    async fn download(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Stop the container, killing it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
