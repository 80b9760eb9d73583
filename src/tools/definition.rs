//! Tool definitions: what to install in an environment and how to tell the model about it.

use crate::sandbox::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which step of a tool's lifecycle a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Install,
    Verify,
    Setup,
    Uninstall,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Install => "install",
            StepKind::Verify => "verify",
            StepKind::Setup => "setup",
            StepKind::Uninstall => "uninstall",
        })
    }
}

/// Container platform as detected by the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ubuntu,
    Debian,
    Alpine,
    Rhel,
    Fedora,
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    /// Key used in `platform*Commands` maps.
    pub fn key(&self) -> &'static str {
        match self {
            Platform::Ubuntu => "ubuntu",
            Platform::Debian => "debian",
            Platform::Alpine => "alpine",
            Platform::Rhel => "rhel",
            Platform::Fedora => "fedora",
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Windows => "windows",
        }
    }

    pub fn is_linux_distro(&self) -> bool {
        matches!(
            self,
            Platform::Ubuntu | Platform::Debian | Platform::Alpine | Platform::Rhel | Platform::Fedora
        )
    }

    /// Recognize a distribution from `/etc/os-release` contents.
    pub fn from_os_release(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        if lower.contains("ubuntu") {
            Some(Platform::Ubuntu)
        } else if lower.contains("debian") {
            Some(Platform::Debian)
        } else if lower.contains("alpine") {
            Some(Platform::Alpine)
        } else if lower.contains("centos") || lower.contains("rhel") {
            Some(Platform::Rhel)
        } else if lower.contains("fedora") {
            Some(Platform::Fedora)
        } else {
            None
        }
    }

    /// Recognize a kernel family from `uname -s` output.
    pub fn from_uname(text: &str) -> Option<Self> {
        let lower = text.trim().to_lowercase();
        if lower.contains("linux") {
            Some(Platform::Linux)
        } else if lower.contains("darwin") {
            Some(Platform::Darwin)
        } else if lower.contains("windows") || lower.contains("mingw") || lower.contains("cygwin") {
            Some(Platform::Windows)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A host file placed into the environment before a tool's install steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCopy {
    /// Host path; relative paths resolve against the definition file's directory.
    pub src: PathBuf,
    /// Absolute path inside the container.
    pub dest: String,
    /// `rwx` digit: 4 read, 2 write, 1 execute.
    pub permissions: u8,
}

/// A tool to install into an environment before the model gets control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Appended to the system prompt.
    #[serde(default, alias = "usage_instructions_to_llm")]
    pub usage_instructions: String,
    /// JSON schema advertised to models that support native tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, alias = "install_commands")]
    pub install_commands: Vec<String>,
    #[serde(default, alias = "verify_commands")]
    pub verify_commands: Vec<String>,
    /// Run in the mount target after every tool is installed.
    #[serde(default, alias = "setup_commands")]
    pub setup_commands: Vec<String>,
    /// Exported to every later command. Values may reference host variables as `${NAME}`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host variables copied verbatim into the environment.
    #[serde(default, alias = "env_variables")]
    pub host_env: Vec<String>,
    #[serde(default, alias = "platform_install_commands")]
    pub platform_install_commands: HashMap<String, Vec<String>>,
    #[serde(default, alias = "platform_verify_commands")]
    pub platform_verify_commands: HashMap<String, Vec<String>>,
    #[serde(default, alias = "platform_setup_commands")]
    pub platform_setup_commands: HashMap<String, Vec<String>>,
    /// Run best effort when the environment is torn down.
    #[serde(default, alias = "uninstall_commands")]
    pub uninstall_commands: Vec<String>,
    #[serde(default, alias = "platform_uninstall_commands")]
    pub platform_uninstall_commands: HashMap<String, Vec<String>>,
    #[serde(default, alias = "files_to_copy")]
    pub files_to_copy: Vec<FileCopy>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load one definition from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Configuration(format!("cannot read tool definition {}: {}", path.display(), e))
        })?;
        let mut tool: ToolDefinition = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Configuration(format!("invalid tool definition {}: {}", path.display(), e))
        })?;
        if let Some(base) = path.parent() {
            for file in &mut tool.files_to_copy {
                if file.src.is_relative() {
                    file.src = base.join(&file.src);
                }
            }
        }
        tool.validate()?;
        Ok(tool)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(SandboxError::Configuration(format!(
                "tool name '{}' must be non-empty and contain no whitespace",
                self.name
            )));
        }
        for key in self.env.keys().chain(self.host_env.iter()) {
            if !is_env_name(key) {
                return Err(SandboxError::Configuration(format!(
                    "tool '{}' declares invalid environment variable name '{}'",
                    self.name, key
                )));
            }
        }
        for file in &self.files_to_copy {
            if file.permissions > 7 {
                return Err(SandboxError::Configuration(format!(
                    "tool '{}': permissions for {} must be between 0 and 7, got {}",
                    self.name, file.dest, file.permissions
                )));
            }
            if !file.dest.starts_with('/') || file.dest.ends_with('/') {
                return Err(SandboxError::Configuration(format!(
                    "tool '{}': copy destination '{}' must be an absolute file path",
                    self.name, file.dest
                )));
            }
        }
        Ok(())
    }

    /// Name plus version, for logs and errors.
    pub fn label(&self) -> String {
        match &self.version {
            Some(v) => format!("{} (v{})", self.name, v),
            None => self.name.clone(),
        }
    }

    /// Commands for `kind` on `platform`: exact platform override, then `linux`
    /// for Linux distributions, then the defaults.
    pub fn commands_for(&self, kind: StepKind, platform: Platform) -> &[String] {
        let (overrides, defaults) = match kind {
            StepKind::Install => (&self.platform_install_commands, &self.install_commands),
            StepKind::Verify => (&self.platform_verify_commands, &self.verify_commands),
            StepKind::Setup => (&self.platform_setup_commands, &self.setup_commands),
            StepKind::Uninstall => (&self.platform_uninstall_commands, &self.uninstall_commands),
        };
        if let Some(cmds) = overrides.get(platform.key()) {
            return cmds;
        }
        if platform.is_linux_distro() {
            if let Some(cmds) = overrides.get(Platform::Linux.key()) {
                return cmds;
            }
        }
        defaults
    }
}

/// Load every definition in `paths`, in order.
pub fn load_tool_definitions<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<ToolDefinition>> {
    paths.iter().map(ToolDefinition::from_file).collect()
}

pub(crate) fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
