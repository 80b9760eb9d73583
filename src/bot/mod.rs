//! MicroBot: one sandboxed run from provisioning to teardown.

pub mod presets;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::agent::{build_system_prompt, AgentLoop, Conversation, LoopOptions, RunResult, Task};
use crate::llm::{ModelCapability, ModelId, ToolSpec};
use crate::sandbox::{
    Environment, EnvironmentGuard, EnvironmentManager, ErrorSeverity, MountController, MountSpec, Permission,
    SandboxError, WORKDIR,
};
use crate::tools::{install_tools, ToolDefinition};

pub use presets::BotKind;

/// Errors that stop a run before the model gets control.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Setup(#[from] SandboxError),

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl BotError {
    pub fn code(&self) -> &'static str {
        match self {
            BotError::Setup(e) => e.code(),
            BotError::InvalidTask(_) => "INVALID_TASK",
        }
    }
}

/// Host directory to expose, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub path: PathBuf,
    pub permission: Permission,
}

/// Container path to copy back to a host directory once the loop ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collect {
    pub from: String,
    pub to: PathBuf,
}

/// Everything a preset decides about a bot.
#[derive(Debug, Clone, PartialEq)]
pub struct BotConfig {
    pub kind: BotKind,
    pub mount: Option<MountRequest>,
    /// Host files or directories copied (not bound) into the working directory.
    pub additional_mounts: Vec<PathBuf>,
    pub collect: Vec<Collect>,
    /// Role text placed after the shared interaction rules.
    pub role_prompt: String,
    pub tools: Vec<ToolDefinition>,
    /// Prepended to the task instruction.
    pub task_preamble: Option<String>,
}

impl BotConfig {
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_copies(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.additional_mounts.extend(paths);
        self
    }

    pub fn with_collect(mut self, collect: impl IntoIterator<Item = Collect>) -> Self {
        self.collect.extend(collect);
        self
    }
}

fn log_setup_failure(env: &Environment, stage: &str, e: &SandboxError) {
    match e.severity() {
        ErrorSeverity::Warning => warn!(environment_id = %env.id(), stage, code = e.code(), error = %e, "Setup stopped"),
        severity => error!(
            environment_id = %env.id(),
            stage,
            code = e.code(),
            severity = ?severity,
            error = %e,
            "Setup failed"
        ),
    }
}

/// Resolve the extra copies and check that their names stay apart from the mount and each other.
fn plan_copies(
    mounts: &MountController,
    primary: Option<&MountSpec>,
    paths: &[PathBuf],
) -> Result<Vec<PathBuf>, SandboxError> {
    let mut taken: Vec<String> = primary
        .and_then(|m| m.target.rsplit('/').next())
        .map(|name| vec![name.to_string()])
        .unwrap_or_default();
    let mut resolved = Vec::with_capacity(paths.len());
    for path in paths {
        let path = mounts.resolve(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::Configuration(format!("cannot copy {}: no file name", path.display())))?
            .to_string();
        if taken.contains(&name) {
            return Err(SandboxError::Configuration(format!(
                "copy of {} would land on {}/{}, which is already in use",
                path.display(),
                WORKDIR,
                name
            )));
        }
        taken.push(name);
        resolved.push(path);
    }
    Ok(resolved)
}

pub struct MicroBot {
    model_id: ModelId,
    model: Arc<dyn ModelCapability>,
    manager: Arc<EnvironmentManager>,
    mounts: MountController,
    config: BotConfig,
    options: LoopOptions,
}

impl MicroBot {
    pub fn new(
        model_id: ModelId,
        model: Arc<dyn ModelCapability>,
        manager: Arc<EnvironmentManager>,
        mounts: MountController,
        config: BotConfig,
    ) -> Self {
        Self {
            model_id,
            model,
            manager,
            mounts,
            config,
            options: LoopOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }

    /// Provision an environment, copy files in, install tools, drive the
    /// model, collect results, tear down.
    ///
    /// Setup failures (bad mount, provisioning, copies, tool installation)
    /// are returned as `Err` before any model call. Every loop outcome,
    /// including timeouts and failures, is an `Ok(RunResult)`. Collection and
    /// teardown failures are logged and do not replace the run's outcome.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> Result<RunResult, BotError> {
        task.validate().map_err(BotError::InvalidTask)?;
        let span = tracing::info_span!("run", bot = %self.config.kind, model = %self.model_id);
        self.run_inner(task, cancel).instrument(span).await
    }

    async fn run_inner(&self, task: Task, cancel: CancellationToken) -> Result<RunResult, BotError> {
        let mount = match &self.config.mount {
            Some(request) => Some(self.mounts.plan(&request.path, request.permission)?),
            None => None,
        };

        let copies = plan_copies(&self.mounts, mount.as_ref(), &self.config.additional_mounts)?;

        let env = self.manager.create(mount).await?;
        let guard = EnvironmentGuard::new(self.manager.clone(), env.clone());

        let copied = match self.copy_in(&env, &copies).await {
            Ok(copied) => copied,
            Err(e) => {
                log_setup_failure(&env, "copy", &e);
                if let Err(teardown) = guard.release().await {
                    error!(environment_id = %env.id(), error = %teardown, "Teardown after failed setup failed");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = install_tools(&self.manager, &env, &self.config.tools, &cancel).await {
            log_setup_failure(&env, "install", &e);
            if let Err(teardown) = guard.release().await {
                error!(environment_id = %env.id(), error = %teardown, "Teardown after failed setup failed");
            }
            return Err(e.into());
        }

        let system_prompt = build_system_prompt(&self.config.role_prompt, env.mount(), &self.config.tools);
        let mut preamble: Vec<String> = self.config.task_preamble.iter().cloned().collect();
        if !copied.is_empty() {
            preamble.push(format!("Copies of these files are available: {}", copied.join(", ")));
        }
        let instruction = if preamble.is_empty() {
            task.instruction.clone()
        } else {
            format!("{}\n\n{}", preamble.join("\n"), task.instruction)
        };
        let conversation = Conversation::new(system_prompt, instruction);

        let mut tool_specs = vec![ToolSpec::run_command(), ToolSpec::complete_task()];
        tool_specs.extend(self.config.tools.iter().filter_map(|t| {
            t.parameters.as_ref().map(|parameters| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: parameters.clone(),
            })
        }));

        let report = AgentLoop::new(
            &self.manager,
            &env,
            self.model.as_ref(),
            tool_specs,
            self.options.clone(),
        )
        .run(&task, conversation, &cancel)
        .await;
        let result = RunResult::from_report(report, &task);

        self.collect_out(&env).await;

        if let Err(e) = guard.release().await {
            error!(environment_id = %env.id(), error = %e, "Teardown failed");
        }

        info!(
            status = ?result.status,
            iterations = result.iterations,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(result)
    }

    async fn copy_in(&self, env: &Environment, copies: &[PathBuf]) -> Result<Vec<String>, SandboxError> {
        let mut copied = Vec::with_capacity(copies.len());
        for path in copies {
            let dest = self.manager.copy_to(env, path, WORKDIR).await.map_err(|e| match e {
                SandboxError::EnvironmentLost(_) => e,
                other => SandboxError::Provision(format!("copying {}: {}", path.display(), other)),
            })?;
            copied.push(dest);
        }
        Ok(copied)
    }

    async fn collect_out(&self, env: &Environment) {
        for Collect { from, to } in &self.config.collect {
            if let Err(e) = self.manager.copy_from(env, from, to).await {
                warn!(environment_id = %env.id(), from = %from, to = %to.display(), error = %e, "Collecting output failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_must_not_shadow_the_mount() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("project")).unwrap();
        std::fs::create_dir(root.path().join("other")).unwrap();
        std::fs::create_dir(root.path().join("nested")).unwrap();
        std::fs::create_dir(root.path().join("nested/project")).unwrap();
        let mounts = MountController::new(root.path()).unwrap();
        let primary = mounts.plan(root.path().join("project"), Permission::ReadWrite).unwrap();

        let ok = plan_copies(&mounts, Some(&primary), &[root.path().join("other")]).unwrap();
        assert!(ok[0].ends_with("other"));

        let err = plan_copies(&mounts, Some(&primary), &[root.path().join("nested/project")]).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
    }

    #[test]
    fn copies_must_stay_in_the_approved_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let mounts = MountController::new(root.path()).unwrap();

        let err = plan_copies(&mounts, None, &[outside.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, SandboxError::Permission(_)));
    }

    #[test]
    fn duplicate_copy_names_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("a/data")).unwrap();
        std::fs::create_dir_all(root.path().join("b/data")).unwrap();
        let mounts = MountController::new(root.path()).unwrap();

        let err = plan_copies(&mounts, None, &[root.path().join("a/data"), root.path().join("b/data")]).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration(_)));
    }
}
