//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared test infrastructure including:
//! - an in-memory container runtime that records what it was asked to do
//! - a scripted model that replays canned replies
//! - proptest configuration presets
#![allow(dead_code)]

use async_trait::async_trait;
use microbots::llm::{ModelCapability, ModelError, ModelRequest};
use microbots::sandbox::{CappedBuffer, ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, RuntimeError};
use proptest::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Standard proptest configuration with minimum 100 iterations.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// Container runtime that never touches Docker.
///
/// The user command is the last argv element of every exec. `sleep N`
/// really sleeps; `flood N` prints N bytes; commands containing any of
/// `failing` exit 1, any of `lost_on` report the container gone, any of
/// `api_error_on` fail at the API; everything else exits 0 and prints `ok`.
#[derive(Default)]
pub struct FakeRuntime {
    pub failing: Vec<String>,
    pub lost_on: Vec<String>,
    pub api_error_on: Vec<String>,
    /// `remove_container` fails after counting the attempt.
    pub fail_remove: bool,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub commands: Mutex<Vec<String>>,
    /// `(dest_dir, archive)` per upload.
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    /// Archives served by `download`, keyed by container path.
    pub downloads: Mutex<HashMap<String, Vec<u8>>>,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub removed: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(pattern: &str) -> Self {
        Self {
            failing: vec![pattern.to_string()],
            ..Self::default()
        }
    }

    pub fn lost_on(pattern: &str) -> Self {
        Self {
            lost_on: vec![pattern.to_string()],
            ..Self::default()
        }
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn serve(&self, path: &str, archive: Vec<u8>) {
        self.downloads.lock().unwrap().insert(path.to_string(), archive);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut created = self.created.lock().unwrap();
        created.push(spec.clone());
        Ok(format!("fake-{}", created.len()))
    }

    async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, _id: &str, exec: &ExecSpec) -> Result<ExecOutput, RuntimeError> {
        let command = exec.cmd.last().cloned().unwrap_or_default();
        self.commands.lock().unwrap().push(command.clone());

        if let Some(secs) = command
            .strip_prefix("sleep ")
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        if self.lost_on.iter().any(|p| command.contains(p.as_str())) {
            return Err(RuntimeError::Gone("container exited".to_string()));
        }
        if self.api_error_on.iter().any(|p| command.contains(p.as_str())) {
            return Err(RuntimeError::Api("exec create rejected".to_string()));
        }
        if self.failing.iter().any(|p| command.contains(p.as_str())) {
            return Ok(ExecOutput {
                stderr: b"command failed".to_vec(),
                exit_code: Some(1),
                ..ExecOutput::default()
            });
        }
        if let Some(n) = command
            .strip_prefix("flood ")
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            let mut stdout = CappedBuffer::new(exec.output_limit);
            for _ in 0..n / 64 {
                stdout.push(&[b'x'; 64]);
            }
            stdout.push(&vec![b'x'; n % 64]);
            let (stdout, stdout_dropped) = stdout.into_parts();
            return Ok(ExecOutput {
                stdout,
                stdout_dropped,
                exit_code: Some(0),
                ..ExecOutput::default()
            });
        }
        let stdout: &[u8] = if command.contains("os-release") {
            b"ID=debian\nNAME=\"Debian GNU/Linux\"\n"
        } else {
            b"ok"
        };
        Ok(ExecOutput {
            stdout: stdout.to_vec(),
            exit_code: Some(0),
            ..ExecOutput::default()
        })
    }

    async fn upload(&self, _id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.uploads.lock().unwrap().push((dest_dir.to_string(), archive));
        Ok(())
    }

    async fn download(&self, _id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        self.downloads
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::Gone(format!("no such path: {}", path)))
    }

    async fn stop_container(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove {
            return Err(RuntimeError::Api("removal refused".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

/// Model that replays `replies` in order, then repeats `fallback` forever.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: impl Into<String>) -> Self {
        let mut model = Self::new(Vec::<String>::new());
        model.fallback = Some(reply.into());
        model
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelCapability for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = self.replies.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or(ModelError::EmptyResponse)
    }
}

/// Wire-format reply asking for one command.
pub fn command_reply(command: &str) -> String {
    serde_json::json!({"task_done": false, "command": command, "result": null}).to_string()
}

/// Wire-format reply asking for several commands in order.
pub fn batch_reply(commands: &[&str]) -> String {
    serde_json::json!({"task_done": false, "commands": commands, "result": null}).to_string()
}

/// Wire-format reply finishing the task.
pub fn done_reply(result: &str) -> String {
    serde_json::json!({"task_done": true, "command": null, "result": result}).to_string()
}
