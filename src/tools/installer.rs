// Tool installation into a running environment

use super::definition::{FileCopy, Platform, StepKind, ToolDefinition};
use crate::sandbox::transfer::mode_from_permissions;
use crate::sandbox::{CommandRequest, Environment, EnvironmentManager, Result, SandboxError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Detect the container platform: distribution first, then kernel family, then `linux`.
pub async fn detect_platform(manager: &EnvironmentManager, env: &Environment) -> Result<Platform> {
    let os_release = manager
        .run_command(env, &CommandRequest::new("cat /etc/os-release 2>/dev/null || true"))
        .await?;
    if os_release.success() {
        if let Some(platform) = Platform::from_os_release(&os_release.stdout) {
            return Ok(platform);
        }
    }

    let uname = manager.run_command(env, &CommandRequest::new("uname -s")).await?;
    if uname.success() {
        if let Some(platform) = Platform::from_uname(&uname.stdout) {
            return Ok(platform);
        }
    }

    warn!(environment_id = %env.id(), "Could not detect platform, defaulting to linux");
    Ok(Platform::Linux)
}

/// Install, configure and verify `tools` in declaration order, then run their setup steps.
///
/// Each tool gets its files copied in, then install, environment export and
/// verify. Every step must exit 0 within the default command timeout. The
/// first failure aborts with `ToolInstallation` naming the tool and the step;
/// cancellation aborts with `Cancelled` at the running step. Uninstall steps
/// are recorded per tool and run when the environment is torn down.
pub async fn install_tools(
    manager: &EnvironmentManager,
    env: &Environment,
    tools: &[ToolDefinition],
    cancel: &CancellationToken,
) -> Result<()> {
    if tools.is_empty() {
        return Ok(());
    }

    let platform = detect_platform(manager, env).await?;
    info!(environment_id = %env.id(), platform = %platform, "Detected platform");

    for tool in tools {
        for file in &tool.files_to_copy {
            copy_file(manager, env, tool, file).await?;
        }
        run_steps(manager, env, tool, StepKind::Install, platform, cancel).await?;
        export_env(env, tool, |name| std::env::var(name).ok())?;
        run_steps(manager, env, tool, StepKind::Verify, platform, cancel).await?;
        env.record_tool(&tool.name, tool.commands_for(StepKind::Uninstall, platform).to_vec());
        info!(environment_id = %env.id(), tool = %tool.label(), "Tool installed");
    }

    for tool in tools {
        run_steps(manager, env, tool, StepKind::Setup, platform, cancel).await?;
    }
    Ok(())
}

async fn copy_file(manager: &EnvironmentManager, env: &Environment, tool: &ToolDefinition, file: &FileCopy) -> Result<()> {
    let failed = |reason: String| SandboxError::ToolInstallation {
        tool: tool.label(),
        reason,
    };
    let content = std::fs::read(&file.src).map_err(|e| failed(format!("cannot read {}: {}", file.src.display(), e)))?;
    manager
        .write_file(env, &file.dest, &content, mode_from_permissions(file.permissions))
        .await
        .map_err(|e| failed(format!("cannot copy {} to {}: {}", file.src.display(), file.dest, e)))?;
    debug!(tool = %tool.name, src = %file.src.display(), dest = %file.dest, "Copied tool file");
    Ok(())
}

async fn run_steps(
    manager: &EnvironmentManager,
    env: &Environment,
    tool: &ToolDefinition,
    kind: StepKind,
    platform: Platform,
    cancel: &CancellationToken,
) -> Result<()> {
    let commands = tool.commands_for(kind, platform);
    if commands.is_empty() {
        debug!(tool = %tool.name, step = %kind, "No commands");
        return Ok(());
    }

    for command in commands {
        debug!(tool = %tool.name, step = %kind, command = %command, "Running tool step");
        let request = CommandRequest::new(command.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SandboxError::Cancelled(format!("during {} step of {}", kind, tool.label())));
            }
            r = manager.run_command(env, &request) => r?,
        };
        if result.timed_out {
            return Err(SandboxError::ToolInstallation {
                tool: tool.label(),
                reason: format!("{} step `{}` timed out", kind, command),
            });
        }
        if result.exit_code != 0 {
            return Err(SandboxError::ToolInstallation {
                tool: tool.label(),
                reason: format!(
                    "{} step `{}` exited with {}: {}",
                    kind,
                    command,
                    result.exit_code,
                    result.stderr.trim()
                ),
            });
        }
    }
    Ok(())
}

fn export_env(
    env: &Environment,
    tool: &ToolDefinition,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let missing = |name: &str| SandboxError::ToolInstallation {
        tool: tool.label(),
        reason: format!("host environment variable {} is not set", name),
    };

    for name in &tool.host_env {
        let value = lookup(name).ok_or_else(|| missing(name))?;
        env.export_var(name, &value);
    }
    for (key, raw) in &tool.env {
        let value = expand_host_vars(raw, &lookup).map_err(|name| missing(&name))?;
        env.export_var(key, &value);
    }
    Ok(())
}

/// Replace every `${NAME}` in `value` using `lookup`. Returns the first missing name on failure.
pub fn expand_host_vars(
    value: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&lookup(name).ok_or_else(|| name.to_string())?);
                rest = &after[end + 1..];
            }
            None => {
                // unterminated: keep literally
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}
