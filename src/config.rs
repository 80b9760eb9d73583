use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::LoopOptions;
use crate::sandbox::{parse_size, ReadOnlyStrategy, SandboxSettings, DEFAULT_IMAGE};

// ---------------------------------------------------------------------------
// Provider configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    #[serde(default)]
    pub api_key: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderEntry,
    #[serde(default)]
    pub openai: ProviderEntry,
    #[serde(default)]
    pub openrouter: ProviderEntry,
    #[serde(default)]
    pub deepseek: ProviderEntry,
    #[serde(default)]
    pub moonshot: ProviderEntry,
    #[serde(default)]
    pub ollama: ProviderEntry,
}

impl ProvidersConfig {
    pub fn entry(&self, provider: &str) -> Option<&ProviderEntry> {
        match provider {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "openrouter" => Some(&self.openrouter),
            "deepseek" => Some(&self.deepseek),
            "moonshot" => Some(&self.moonshot),
            "ollama" => Some(&self.ollama),
            _ => None,
        }
    }

    /// Configured key, else `<PROVIDER>_API_KEY` from the environment.
    pub fn api_key(&self, provider: &str) -> String {
        let configured = self
            .entry(provider)
            .map(|e| e.api_key.trim().to_string())
            .unwrap_or_default();
        if !configured.is_empty() {
            return configured;
        }
        std::env::var(format!("{}_API_KEY", provider.to_uppercase())).unwrap_or_default()
    }

    pub fn api_base(&self, provider: &str) -> Option<String> {
        self.entry(provider).and_then(|e| e.api_base.clone())
    }
}

// ---------------------------------------------------------------------------
// Run defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_protocol_errors")]
    pub max_protocol_errors: u32,
    #[serde(default)]
    pub history_window: Option<usize>,
    #[serde(default = "default_true")]
    pub count_timed_out_iterations: bool,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-5".into()
}
fn default_timeout_secs() -> u64 {
    200
}
fn default_max_iterations() -> u32 {
    20
}
fn default_max_protocol_errors() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_iterations: default_max_iterations(),
            max_protocol_errors: default_max_protocol_errors(),
            history_window: None,
            count_timed_out_iterations: true,
        }
    }
}

impl RunDefaults {
    pub fn to_loop_options(&self) -> LoopOptions {
        LoopOptions {
            max_protocol_errors: self.max_protocol_errors,
            history_window: self.history_window,
            count_timed_out_iterations: self.count_timed_out_iterations,
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
    #[serde(default = "default_true")]
    pub network_enabled: bool,
    /// e.g. "2G", "512M"
    #[serde(default)]
    pub max_memory: Option<String>,
    #[serde(default)]
    pub max_cpu: Option<f64>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub read_only_strategy: ReadOnlyStrategy,
    /// Mounts must resolve inside this directory.
    #[serde(default = "default_approved_root")]
    pub approved_root: String,
}

fn default_image() -> String {
    DEFAULT_IMAGE.into()
}
fn default_shell() -> Vec<String> {
    vec!["/bin/bash".into(), "-lc".into()]
}
fn default_command_timeout_secs() -> u64 {
    300
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_stop_grace_secs() -> u64 {
    2
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_approved_root() -> String {
    "~".into()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            shell: default_shell(),
            network_enabled: true,
            max_memory: None,
            max_cpu: None,
            command_timeout_secs: default_command_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            max_output_bytes: default_max_output_bytes(),
            read_only_strategy: ReadOnlyStrategy::default(),
            approved_root: default_approved_root(),
        }
    }
}

impl SandboxConfig {
    pub fn to_settings(&self) -> Result<SandboxSettings> {
        let max_memory = self
            .max_memory
            .as_deref()
            .map(parse_size)
            .transpose()
            .context("parsing sandbox.maxMemory")?;
        let settings = SandboxSettings {
            image: self.image.clone(),
            shell: self.shell.clone(),
            network_enabled: self.network_enabled,
            max_memory,
            max_cpu: self.max_cpu,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            max_output_bytes: self.max_output_bytes,
            read_only_strategy: self.read_only_strategy,
        };
        settings.validate().context("invalid sandbox settings")?;
        Ok(settings)
    }

    pub fn approved_root_path(&self) -> PathBuf {
        expand_home(&self.approved_root)
    }
}

// ---------------------------------------------------------------------------
// Log config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// text | json | compact | pretty
    #[serde(default = "default_log_format")]
    pub format: String,
    /// local | utc | rfc3339 | custom
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default)]
    pub custom_timestamp_format: Option<String>,
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub show_level: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default)]
    pub show_thread_names: bool,
    #[serde(default)]
    pub show_thread_ids: bool,
    #[serde(default)]
    pub show_file: bool,
    /// Daily rolling log files go here when set.
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_timestamp_format() -> String {
    "local".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamp_format: default_timestamp_format(),
            custom_timestamp_format: None,
            module_levels: HashMap::new(),
            show_level: true,
            show_target: true,
            show_thread_names: false,
            show_thread_ids: false,
            show_file: false,
            dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub run: RunDefaults,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".microbots")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" || raw.starts_with("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(raw.trim_start_matches('~').trim_start_matches('/'))
    } else {
        PathBuf::from(raw)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        let cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?;
        Ok(cfg)
    } else {
        Ok(Config::default())
    }
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(&p, json)?;
    Ok(())
}
