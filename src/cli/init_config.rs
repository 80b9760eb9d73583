use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::config;

pub fn cmd_init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    crate::logging::init_simple_logging();
    let target = path.unwrap_or_else(config::config_path);
    if target.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", target.display());
    }
    config::save_config(&config::Config::default(), Some(&target))?;
    info!(path = %target.display(), "Config written");
    println!("Config written to {}", target.display());
    Ok(())
}
