// Command execution inside a running environment with per-command deadlines.

use super::config::SandboxSettings;
use super::error::{Result, SandboxError};
use super::runtime::{ContainerRuntime, ExecSpec};
use super::shell::truncate_output_after;
use super::types::{CommandRequest, CommandResult};
use std::time::{Duration, Instant};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Records the wrapper's pid in `$0`, then execs the shell with the command.
const PID_WRAPPER: &str = "echo $$ > \"$0\"; exec \"$@\"";

/// Kills the recorded process and everything below it.
const KILL_SCRIPT: &str = r#"kt() { for c in $(cat /proc/$1/task/*/children 2>/dev/null || pgrep -P "$1" 2>/dev/null); do kt "$c"; done; kill -KILL "$1" 2>/dev/null; }
pid=$(cat "$0" 2>/dev/null) && kt "$pid"
rm -f "$0"
exit 0"#;

/// Where one command runs.
#[derive(Debug, Clone)]
pub struct ExecTarget<'a> {
    pub container_id: &'a str,
    /// `KEY=value` entries exported by tool installation.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

/// Stateless command runner; one per manager.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: Vec<String>,
    default_timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            default_timeout: settings.command_timeout,
            kill_grace: settings.kill_grace,
            max_output_bytes: settings.max_output_bytes,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Full argv for `command`, wrapped so its pid lands in `pidfile`.
    pub fn wrap(&self, pidfile: &str, command: &str) -> Vec<String> {
        let mut cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            PID_WRAPPER.to_string(),
            pidfile.to_string(),
        ];
        cmd.extend(self.shell.iter().cloned());
        cmd.push(command.to_string());
        cmd
    }

    /// Run one command to completion or until its deadline.
    ///
    /// A command still running at the deadline is killed (bounded by the kill
    /// grace) and reported with `timed_out` set and exit code 124. A vanished
    /// container or daemon surfaces as `EnvironmentLost`; any other runtime
    /// rejection as `Runtime`.
    pub async fn execute(
        &self,
        runtime: &dyn ContainerRuntime,
        target: &ExecTarget<'_>,
        request: &CommandRequest,
    ) -> Result<CommandResult> {
        let deadline = request.timeout.unwrap_or(self.default_timeout);
        let pidfile = format!("/tmp/.microbots-exec-{}.pid", Uuid::new_v4().simple());
        let spec = ExecSpec {
            cmd: self.wrap(&pidfile, &request.command),
            env: target.env.clone(),
            working_dir: target.working_dir.clone(),
            output_limit: Some(self.max_output_bytes),
        };

        debug!(
            container_id = %target.container_id,
            timeout_secs = deadline.as_secs_f64(),
            command = %request.command,
            "Executing command"
        );

        let started = Instant::now();
        match tokio_timeout(deadline, runtime.exec(target.container_id, &spec)).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                Ok(CommandResult {
                    stdout: truncate_output_after(&stdout, self.max_output_bytes, output.stdout_dropped),
                    stderr: truncate_output_after(&stderr, self.max_output_bytes, output.stderr_dropped),
                    exit_code: output.exit_code.unwrap_or(-1),
                    elapsed: started.elapsed(),
                    timed_out: false,
                })
            }
            Ok(Err(e)) if e.is_environment_lost() => Err(SandboxError::EnvironmentLost(e.to_string())),
            Ok(Err(e)) => Err(SandboxError::Runtime(e.to_string())),
            Err(_) => {
                warn!(
                    container_id = %target.container_id,
                    timeout_secs = deadline.as_secs_f64(),
                    "Command exceeded its deadline, killing"
                );
                self.kill(runtime, target.container_id, &pidfile).await;
                Ok(CommandResult::timed_out(deadline, started.elapsed()))
            }
        }
    }

    async fn kill(&self, runtime: &dyn ContainerRuntime, container_id: &str, pidfile: &str) {
        let spec = ExecSpec {
            cmd: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                KILL_SCRIPT.to_string(),
                pidfile.to_string(),
            ],
            ..Default::default()
        };
        match tokio_timeout(self.kill_grace, runtime.exec(container_id, &spec)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(container_id = %container_id, error = %e, "Kill after timeout failed"),
            Err(_) => warn!(container_id = %container_id, "Kill after timeout did not finish in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::{ContainerSpec, ExecOutput, RuntimeError};

    #[test]
    fn wrap_puts_command_last() {
        let executor = CommandExecutor::from_settings(&SandboxSettings::default());
        let argv = executor.wrap("/tmp/p.pid", "ls -la");
        assert_eq!(argv[0], "/bin/sh");
        assert_eq!(argv[3], "/tmp/p.pid");
        assert_eq!(&argv[4..6], &["/bin/bash".to_string(), "-lc".to_string()]);
        assert_eq!(argv.last().unwrap(), "ls -la");
    }

    struct FailingRuntime(RuntimeError);

    #[async_trait::async_trait]
    impl ContainerRuntime for FailingRuntime {
        fn name(&self) -> &str {
            "failing"
        }
        async fn ensure_image(&self, _image: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
        async fn create_container(&self, _spec: &ContainerSpec) -> std::result::Result<String, RuntimeError> {
            Ok("c".into())
        }
        async fn start_container(&self, _id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
        async fn exec(&self, _id: &str, _exec: &ExecSpec) -> std::result::Result<ExecOutput, RuntimeError> {
            Err(self.0.clone())
        }
        async fn upload(&self, _id: &str, _dest: &str, _archive: Vec<u8>) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
        async fn download(&self, _id: &str, _path: &str) -> std::result::Result<Vec<u8>, RuntimeError> {
            Ok(Vec::new())
        }
        async fn stop_container(&self, _id: &str, _grace: Duration) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
    }

    async fn run_against(err: RuntimeError) -> SandboxError {
        let executor = CommandExecutor::from_settings(&SandboxSettings::default());
        let target = ExecTarget {
            container_id: "c",
            env: Vec::new(),
            working_dir: None,
        };
        executor
            .execute(&FailingRuntime(err), &target, &CommandRequest::new("ls"))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn gone_container_is_environment_lost() {
        let err = run_against(RuntimeError::Gone("no such container".into())).await;
        assert!(matches!(err, SandboxError::EnvironmentLost(_)));
    }

    #[tokio::test]
    async fn api_rejection_is_a_runtime_error() {
        let err = run_against(RuntimeError::Api("bad request (400)".into())).await;
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn default_timeout_comes_from_settings() {
        let settings = SandboxSettings {
            command_timeout: Duration::from_secs(7),
            ..Default::default()
        };
        assert_eq!(
            CommandExecutor::from_settings(&settings).default_timeout(),
            Duration::from_secs(7)
        );
    }
}
