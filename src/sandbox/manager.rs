// Environment Manager - owns the lifecycle of sandbox environments

use super::config::SandboxSettings;
use super::error::{Result, SandboxError};
use super::executor::{CommandExecutor, ExecTarget};
use super::mount::{MountSpec, OverlayPlan, ReadOnlyStrategy, WORKDIR};
use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use super::shell::shell_quote;
use super::transfer::{pack_file, pack_path, unpack_into};
use super::types::{CommandRequest, CommandResult, EnvironmentInfo, EnvironmentState};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capabilities kept after `cap_drop ALL`; enough for package managers to install tools.
pub const BASE_CAPABILITIES: &[&str] = &["CHOWN", "DAC_OVERRIDE", "FOWNER", "FSETID", "SETUID", "SETGID", "KILL"];

/// Label put on every container so leaked ones can be found with `docker ps --filter`.
pub const ENVIRONMENT_LABEL: &str = "io.microbots.environment";

#[derive(Debug)]
struct EnvironmentInner {
    state: EnvironmentState,
    container_id: Option<String>,
    installed_tools: Vec<String>,
    // (tool, commands) in install order; run in reverse at teardown
    uninstall_steps: Vec<(String, Vec<String>)>,
    env_vars: BTreeMap<String, String>,
}

/// One isolated container plus its mount and installed tools.
///
/// Shared as `Arc<Environment>` between the bot, the agent loop and the
/// teardown guard. All mutation goes through the manager.
#[derive(Debug)]
pub struct Environment {
    id: String,
    created_at: DateTime<Utc>,
    mount: Option<MountSpec>,
    inner: Mutex<EnvironmentInner>,
    // serializes teardown so a second caller waits for the first
    teardown_lock: tokio::sync::Mutex<()>,
}

impl Environment {
    fn new(mount: Option<MountSpec>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            mount,
            inner: Mutex::new(EnvironmentInner {
                state: EnvironmentState::Created,
                container_id: None,
                installed_tools: Vec::new(),
                uninstall_steps: Vec::new(),
                env_vars: BTreeMap::new(),
            }),
            teardown_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnvironmentInner> {
        // state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> EnvironmentState {
        self.lock().state
    }

    pub fn container_id(&self) -> Option<String> {
        self.lock().container_id.clone()
    }

    pub fn mount(&self) -> Option<&MountSpec> {
        self.mount.as_ref()
    }

    /// Directory commands start in: the mount target, or `/workdir` without a mount.
    pub fn working_dir(&self) -> String {
        self.mount
            .as_ref()
            .map(|m| m.target.clone())
            .unwrap_or_else(|| WORKDIR.to_string())
    }

    pub fn installed_tools(&self) -> Vec<String> {
        self.lock().installed_tools.clone()
    }

    pub fn env_vars(&self) -> BTreeMap<String, String> {
        self.lock().env_vars.clone()
    }

    /// Mark `name` installed; `uninstall` runs when the environment is torn down.
    pub(crate) fn record_tool(&self, name: &str, uninstall: Vec<String>) {
        let mut inner = self.lock();
        if !inner.installed_tools.iter().any(|t| t == name) {
            inner.installed_tools.push(name.to_string());
            if !uninstall.is_empty() {
                inner.uninstall_steps.push((name.to_string(), uninstall));
            }
        }
    }

    pub(crate) fn export_var(&self, key: &str, value: &str) {
        self.lock().env_vars.insert(key.to_string(), value.to_string());
    }

    fn set_state(&self, state: EnvironmentState) {
        self.lock().state = state;
    }

    pub fn info(&self) -> EnvironmentInfo {
        let inner = self.lock();
        EnvironmentInfo {
            id: self.id.clone(),
            state: inner.state,
            container_id: inner.container_id.clone(),
            mount_target: self.mount.as_ref().map(|m| m.target.clone()),
            permission: self.mount.as_ref().map(|m| m.permission),
            installed_tools: inner.installed_tools.clone(),
            created_at: self.created_at,
        }
    }
}

/// Environment Manager
///
/// The EnvironmentManager is responsible for:
/// - Provisioning containers with the requested mount
/// - Running commands inside running environments
/// - Tearing environments down exactly once
pub struct EnvironmentManager {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
    executor: CommandExecutor,
    teardowns: AtomicUsize,
}

impl EnvironmentManager {
    /// Create a new EnvironmentManager
    ///
    /// # Arguments
    ///
    /// * `runtime` - Container runtime shared by every environment
    /// * `settings` - Image, shell, limits and timeouts
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        let executor = CommandExecutor::from_settings(&settings);
        Self {
            runtime,
            settings,
            executor,
            teardowns: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Number of environments this manager has removed.
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Provision a running environment
    ///
    /// Pulls the image if needed, creates and starts the container, then
    /// builds the read-only view when the mount asks for one.
    ///
    /// # Errors
    ///
    /// Returns `Provision` if any step fails. Nothing is left behind in that
    /// case: a partially created container is removed before returning.
    pub async fn create(&self, mount: Option<MountSpec>) -> Result<Arc<Environment>> {
        self.settings.validate()?;
        let env = Arc::new(Environment::new(mount));

        self.runtime
            .ensure_image(&self.settings.image)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;

        let spec = self.container_spec(&env);
        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        env.lock().container_id = Some(container_id.clone());

        if let Err(e) = self.runtime.start_container(&container_id).await {
            self.abort(&env).await;
            return Err(SandboxError::Provision(e.to_string()));
        }
        env.set_state(EnvironmentState::Running);

        if let Some(plan) = env.mount().and_then(|m| m.overlay()).cloned() {
            if let Err(e) = self.build_read_only_view(&env, &plan).await {
                self.abort(&env).await;
                return Err(e);
            }
        }

        info!(
            environment_id = %env.id(),
            container_id = %container_id,
            runtime = %self.runtime.name(),
            image = %self.settings.image,
            mount = ?env.mount().map(|m| &m.target),
            "Environment created"
        );
        Ok(env)
    }

    fn container_spec(&self, env: &Environment) -> ContainerSpec {
        let mount = env.mount();
        let mut cap_add: Vec<String> = BASE_CAPABILITIES.iter().map(|c| c.to_string()).collect();
        if mount.map(|m| m.needs_mount_capability()).unwrap_or(false) {
            cap_add.push("SYS_ADMIN".to_string());
        }
        ContainerSpec {
            name: format!("microbots-{}", env.id()),
            image: self.settings.image.clone(),
            binds: mount.map(|m| m.binds()).unwrap_or_default(),
            tmpfs: mount
                .and_then(|m| m.scratch_tmpfs())
                .map(|p| vec![p.to_string()])
                .unwrap_or_default(),
            network_enabled: self.settings.network_enabled,
            memory: self.settings.max_memory,
            cpus: self.settings.max_cpu,
            cap_add,
            labels: vec![(ENVIRONMENT_LABEL.to_string(), env.id().to_string())],
            working_dir: Some(WORKDIR.to_string()),
        }
    }

    async fn build_read_only_view(&self, env: &Environment, plan: &OverlayPlan) -> Result<()> {
        if plan.strategy == ReadOnlyStrategy::Overlay {
            let result = self
                .exec_in(env, &CommandRequest::new(plan.mount_script()?), "/".to_string())
                .await?;
            if result.success() {
                debug!(environment_id = %env.id(), merged = %plan.merged, "Overlay mounted");
                return Ok(());
            }
            warn!(
                environment_id = %env.id(),
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "Overlay mount refused, falling back to copy"
            );
        }

        let result = self
            .exec_in(env, &CommandRequest::new(plan.copy_script()?), "/".to_string())
            .await?;
        if result.success() {
            Ok(())
        } else {
            Err(SandboxError::Provision(format!(
                "could not build read-only view at {}: {}",
                plan.merged,
                result.stderr.trim()
            )))
        }
    }

    async fn abort(&self, env: &Environment) {
        if let Err(e) = self.teardown(env).await {
            error!(environment_id = %env.id(), error = %e, "Cleanup after failed provisioning failed");
        }
    }

    /// Run one command inside `env`
    ///
    /// Commands start in the mount target with every variable exported by tool
    /// installation. Command failures are reported in the result, never as errors.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the environment is not running
    /// - `EnvironmentLost` if the container or daemon disappeared
    pub async fn run_command(&self, env: &Environment, request: &CommandRequest) -> Result<CommandResult> {
        self.exec_in(env, request, env.working_dir()).await
    }

    fn running_container(env: &Environment) -> Result<String> {
        let inner = env.lock();
        match (inner.state, inner.container_id.as_ref()) {
            (EnvironmentState::Running, Some(id)) => Ok(id.clone()),
            (state, _) => Err(SandboxError::InvalidState {
                expected: EnvironmentState::Running.to_string(),
                actual: state.to_string(),
            }),
        }
    }

    async fn exec_in(&self, env: &Environment, request: &CommandRequest, working_dir: String) -> Result<CommandResult> {
        let container_id = Self::running_container(env)?;
        let env_vars = env.env_vars();

        let target = ExecTarget {
            container_id: &container_id,
            env: env_vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            working_dir: Some(working_dir),
        };
        let result = self.executor.execute(self.runtime.as_ref(), &target, request).await;
        if let Err(SandboxError::EnvironmentLost(reason)) = &result {
            error!(environment_id = %env.id(), reason = %reason, "Environment lost");
        }
        result
    }

    async fn ensure_dir(&self, env: &Environment, dir: &str) -> Result<()> {
        let result = self
            .exec_in(env, &CommandRequest::new(format!("mkdir -p {}", shell_quote(dir)?)), "/".to_string())
            .await?;
        if result.success() {
            Ok(())
        } else {
            Err(SandboxError::Runtime(format!(
                "cannot create {}: {}",
                dir,
                result.stderr.trim()
            )))
        }
    }

    async fn upload(&self, env: &Environment, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let container_id = Self::running_container(env)?;
        self.ensure_dir(env, dest_dir).await?;
        self.runtime
            .upload(&container_id, dest_dir, archive)
            .await
            .map_err(|e| {
                if e.is_environment_lost() {
                    SandboxError::EnvironmentLost(e.to_string())
                } else {
                    SandboxError::Runtime(e.to_string())
                }
            })
    }

    /// Copy a host file or directory into `dest_dir` of `env`, keeping its base name.
    ///
    /// Returns the path of the copy inside the container.
    pub async fn copy_to(&self, env: &Environment, source: &Path, dest_dir: &str) -> Result<String> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::Configuration(format!("cannot copy {}: no file name", source.display())))?;
        let archive = pack_path(source, name)?;
        self.upload(env, dest_dir, archive).await?;
        let dest = format!("{}/{}", dest_dir.trim_end_matches('/'), name);
        info!(environment_id = %env.id(), source = %source.display(), dest = %dest, "Copied into environment");
        Ok(dest)
    }

    /// Write `content` to the absolute container path `dest` with `mode`.
    pub async fn write_file(&self, env: &Environment, dest: &str, content: &[u8], mode: u32) -> Result<()> {
        let (dir, name) = match dest.rsplit_once('/') {
            Some((dir, name)) if !name.is_empty() => (if dir.is_empty() { "/" } else { dir }, name),
            _ => {
                return Err(SandboxError::Configuration(format!(
                    "'{}' is not an absolute file path",
                    dest
                )))
            }
        };
        self.upload(env, dir, pack_file(name, content, mode)?).await?;
        debug!(environment_id = %env.id(), dest = %dest, mode = %format!("{:o}", mode), "Wrote file");
        Ok(())
    }

    /// Copy `path` out of `env` into the host directory `dest_dir`.
    ///
    /// Returns the unpacked entries relative to `dest_dir`. A missing path is
    /// reported as `Runtime`, not as a lost environment.
    pub async fn copy_from(&self, env: &Environment, path: &str, dest_dir: &Path) -> Result<Vec<String>> {
        let container_id = Self::running_container(env)?;
        let archive = self
            .runtime
            .download(&container_id, path)
            .await
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        let entries = unpack_into(&archive, dest_dir)?;
        info!(
            environment_id = %env.id(),
            path = %path,
            dest = %dest_dir.display(),
            entries = entries.len(),
            "Copied out of environment"
        );
        Ok(entries)
    }

    /// Run every recorded uninstall step, newest tool first. Failures are logged and skipped.
    async fn uninstall_tools(&self, env: &Environment) {
        let steps = std::mem::take(&mut env.lock().uninstall_steps);
        for (tool, commands) in steps.into_iter().rev() {
            for command in commands {
                match self.exec_in(env, &CommandRequest::new(command.clone()), env.working_dir()).await {
                    Ok(result) if result.success() => {
                        debug!(environment_id = %env.id(), tool = %tool, command = %command, "Uninstall step done")
                    }
                    Ok(result) => warn!(
                        environment_id = %env.id(),
                        tool = %tool,
                        command = %command,
                        exit_code = result.exit_code,
                        timed_out = result.timed_out,
                        "Uninstall step failed"
                    ),
                    Err(SandboxError::EnvironmentLost(reason)) => {
                        warn!(environment_id = %env.id(), reason = %reason, "Skipping uninstall, environment lost");
                        return;
                    }
                    Err(e) => warn!(environment_id = %env.id(), tool = %tool, error = %e, "Uninstall step failed"),
                }
            }
        }
    }

    /// Stop and remove `env`
    ///
    /// A running environment first gets the uninstall steps of its tools, best
    /// effort. Idempotent: calling it again after success, or concurrently, does no
    /// further work. A failure is returned once and the environment is still
    /// marked removed; the container can be found later by its label.
    pub async fn teardown(&self, env: &Environment) -> Result<()> {
        let _serial = env.teardown_lock.lock().await;

        let (state, container_id) = {
            let inner = env.lock();
            (inner.state, inner.container_id.clone())
        };
        if state == EnvironmentState::Removed {
            debug!(environment_id = %env.id(), "Environment already removed");
            return Ok(());
        }

        let mut failure: Option<RuntimeError> = None;
        if let Some(container_id) = container_id.as_deref() {
            if state == EnvironmentState::Running {
                self.uninstall_tools(env).await;
                match self.runtime.stop_container(container_id, self.settings.stop_grace).await {
                    Ok(()) => env.set_state(EnvironmentState::Stopped),
                    Err(e) => debug!(environment_id = %env.id(), error = %e, "Stop failed, forcing removal"),
                }
            }
            match self.runtime.remove_container(container_id).await {
                Ok(()) | Err(RuntimeError::Gone(_)) => {}
                Err(e) => failure = Some(e),
            }
        }

        env.set_state(EnvironmentState::Removed);
        self.teardowns.fetch_add(1, Ordering::SeqCst);

        match failure {
            None => {
                info!(environment_id = %env.id(), "Environment removed");
                Ok(())
            }
            Some(e) => {
                warn!(
                    environment_id = %env.id(),
                    container_id = ?container_id,
                    label = %ENVIRONMENT_LABEL,
                    error = %e,
                    "Container removal failed"
                );
                Err(SandboxError::Teardown(e.to_string()))
            }
        }
    }
}

/// Tears an environment down when the owning scope ends.
///
/// Call [`EnvironmentGuard::release`] on every normal path. If the guard is
/// dropped without it (a panic or a cancelled future), teardown is spawned on
/// the current Tokio runtime.
pub struct EnvironmentGuard {
    manager: Arc<EnvironmentManager>,
    env: Arc<Environment>,
    released: bool,
}

impl EnvironmentGuard {
    pub fn new(manager: Arc<EnvironmentManager>, env: Arc<Environment>) -> Self {
        Self {
            manager,
            env,
            released: false,
        }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub async fn release(mut self) -> Result<()> {
        let result = self.manager.teardown(&self.env).await;
        self.released = true;
        result
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.released || self.env.state() == EnvironmentState::Removed {
            return;
        }
        warn!(environment_id = %self.env.id(), "Environment guard dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                let env = self.env.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.teardown(&env).await {
                        error!(environment_id = %env.id(), error = %e, "Deferred teardown failed");
                    }
                });
            }
            Err(_) => error!(
                environment_id = %self.env.id(),
                container_id = ?self.env.container_id(),
                "No runtime available, container leaked"
            ),
        }
    }
}
