//! Helper functions for CLI commands.

use anyhow::{Context, Result};

use super::RunArgs;
use crate::bot::{presets, BotConfig, BotKind, Collect};
use crate::config::Config;

/// API key and base URL for `provider`; only ollama may run without a key.
pub fn resolve_provider(cfg: &Config, provider: &str) -> Result<(String, Option<String>)> {
    let api_key = cfg.providers.api_key(provider);
    if api_key.is_empty() && provider != "ollama" {
        anyhow::bail!(
            "No API key for provider '{}'. Set {}_API_KEY or edit {}",
            provider,
            provider.to_uppercase(),
            crate::config::config_path().display()
        );
    }
    let api_base = cfg
        .providers
        .api_base(provider)
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty());
    Ok((api_key, api_base))
}

/// Build the preset named by `--bot` from the remaining arguments.
pub fn preset_for(args: &RunArgs) -> Result<BotConfig> {
    let require_mount = || {
        args.mount
            .clone()
            .with_context(|| format!("--mount is required for the {} bot", args.bot))
    };

    let config = match args.bot {
        BotKind::Reading => presets::reading(require_mount()?),
        BotKind::Writing => presets::writing(require_mount()?),
        BotKind::LogAnalysis => {
            let log_file = args
                .log_file
                .as_ref()
                .context("--log-file is required for the log-analysis bot")?;
            presets::log_analysis(require_mount()?, log_file)?
        }
        BotKind::Browsing => presets::browsing(),
        BotKind::Custom => {
            let prompt = args
                .system_prompt
                .clone()
                .context("--system-prompt is required for the custom bot")?;
            presets::custom(args.mount.clone(), prompt)
        }
    };
    Ok(config
        .with_copies(args.copies.iter().cloned())
        .with_collect(args.collect.iter().cloned()))
}

/// Parse `--collect <container path>=<host dir>`.
pub fn parse_collect(s: &str) -> std::result::Result<Collect, String> {
    let (from, to) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <container path>=<host dir>, got '{}'", s))?;
    if !from.starts_with('/') {
        return Err(format!("container path '{}' must be absolute", from));
    }
    if to.is_empty() {
        return Err("host directory must not be empty".to_string());
    }
    Ok(Collect {
        from: from.to_string(),
        to: to.into(),
    })
}
