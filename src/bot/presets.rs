//! Ready-made bot configurations.

use super::{BotConfig, MountRequest};
use crate::sandbox::{Permission, Result, SandboxError, WORKDIR};
use crate::tools::ToolDefinition;
use std::fmt;
use std::path::{Path, PathBuf};

const BROWSE_SCRIPT: &str = include_str!("browse.py");

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BotKind {
    Reading,
    Writing,
    LogAnalysis,
    Browsing,
    Custom,
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BotKind::Reading => "reading",
            BotKind::Writing => "writing",
            BotKind::LogAnalysis => "log-analysis",
            BotKind::Browsing => "browsing",
            BotKind::Custom => "custom",
        })
    }
}

/// Read-only access: the model can change files but nothing reaches the host.
pub fn reading(dir: impl Into<PathBuf>) -> BotConfig {
    BotConfig {
        kind: BotKind::Reading,
        mount: Some(MountRequest {
            path: dir.into(),
            permission: Permission::ReadOnly,
        }),
        additional_mounts: Vec::new(),
        collect: Vec::new(),
        role_prompt: "ROLE: You are a reading bot with read-only access to files.\n\
                      Once all commands are executed and the task is verified, provide the final result."
            .to_string(),
        tools: Vec::new(),
        task_preamble: None,
    }
}

/// Read-write access: changes land in the host directory.
pub fn writing(dir: impl Into<PathBuf>) -> BotConfig {
    BotConfig {
        kind: BotKind::Writing,
        mount: Some(MountRequest {
            path: dir.into(),
            permission: Permission::ReadWrite,
        }),
        additional_mounts: Vec::new(),
        collect: Vec::new(),
        role_prompt: "ROLE: You are a writing bot with read-write access to files.\n\
                      Make the requested changes directly in the mounted directory, verify them, \
                      then provide the final result."
            .to_string(),
        tools: Vec::new(),
        task_preamble: None,
    }
}

/// Read-only analysis of one log file, which must live inside `dir`.
pub fn log_analysis(dir: impl AsRef<Path>, log_file: impl AsRef<Path>) -> Result<BotConfig> {
    let dir = dir.as_ref();
    let log_file = log_file.as_ref();
    let canonical_dir = std::fs::canonicalize(dir).map_err(|e| {
        SandboxError::Configuration(format!("log directory {} is not accessible: {}", dir.display(), e))
    })?;
    let candidate = if log_file.is_absolute() {
        log_file.to_path_buf()
    } else {
        canonical_dir.join(log_file)
    };
    let canonical_log = std::fs::canonicalize(&candidate).map_err(|e| {
        SandboxError::Configuration(format!("log file {} does not exist: {}", log_file.display(), e))
    })?;
    if !canonical_log.is_file() {
        return Err(SandboxError::Configuration(format!(
            "log file {} is not a regular file",
            canonical_log.display()
        )));
    }
    let relative = canonical_log.strip_prefix(&canonical_dir).map_err(|_| {
        SandboxError::Permission(format!(
            "log file {} is outside the mounted directory {}",
            canonical_log.display(),
            canonical_dir.display()
        ))
    })?;

    let dir_name = canonical_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("mount");
    let in_container = format!("{}/{}/{}", WORKDIR, dir_name, relative.display());

    Ok(BotConfig {
        kind: BotKind::LogAnalysis,
        mount: Some(MountRequest {
            path: canonical_dir,
            permission: Permission::ReadOnly,
        }),
        additional_mounts: Vec::new(),
        collect: Vec::new(),
        role_prompt: "ROLE: You are a log analysis bot with read-only access to files.\n\
                      Find the root cause of the failure recorded in the log, using the source \
                      files in the mounted directory where useful. Once the analysis is verified, \
                      provide the final result."
            .to_string(),
        tools: Vec::new(),
        task_preamble: Some(format!("The log file to analyze is {}", in_container)),
    })
}

/// Web browsing through the `browse` tool; no host directory.
pub fn browsing() -> BotConfig {
    BotConfig {
        kind: BotKind::Browsing,
        mount: None,
        additional_mounts: Vec::new(),
        collect: Vec::new(),
        role_prompt: "ROLE: You are a browsing bot. Use the `browse` command to look things up on the web \
                      and provide the final result once you have the answer."
            .to_string(),
        tools: vec![browser_tool()],
        task_preamble: None,
    }
}

/// Caller-supplied role prompt, read-write access when a directory is given.
pub fn custom(dir: Option<PathBuf>, role_prompt: impl Into<String>) -> BotConfig {
    BotConfig {
        kind: BotKind::Custom,
        mount: dir.map(|path| MountRequest {
            path,
            permission: Permission::ReadWrite,
        }),
        additional_mounts: Vec::new(),
        collect: Vec::new(),
        role_prompt: role_prompt.into(),
        tools: Vec::new(),
        task_preamble: None,
    }
}

/// Headless browser agent exposed to the model as `browse '<query>'`.
pub fn browser_tool() -> ToolDefinition {
    let mut tool = ToolDefinition::new("browse");
    tool.description = "Search the web with a headless browser agent.".to_string();
    tool.usage_instructions = "Run `browse '<query>'` with one quoted query. \
                               The answer is printed after the line `Final Result:`."
        .to_string();
    tool.parameters = Some(serde_json::json!({
        "type": "object",
        "properties": {
            "args": {"type": "string", "description": "Shell-quoted query, e.g. 'latest tokio release'"}
        },
        "required": ["args"]
    }));
    tool.install_commands = vec![
        "pip install --quiet --no-cache-dir browser-use playwright".to_string(),
        "python -m playwright install --with-deps chromium".to_string(),
        format!(
            "cat > /usr/local/bin/browse <<'MICROBOTS_EOF'\n{}\nMICROBOTS_EOF\nchmod +x /usr/local/bin/browse",
            BROWSE_SCRIPT.trim_end()
        ),
    ];
    tool.verify_commands = vec!["test -x /usr/local/bin/browse".to_string()];
    tool.host_env = vec!["OPENAI_API_KEY".to_string()];
    tool
}
