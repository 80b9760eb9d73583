use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::helpers::{preset_for, resolve_provider};
use super::RunArgs;
use crate::agent::Task;
use crate::bot::MicroBot;
use crate::config;
use crate::llm::{build_model, ModelId};
use crate::sandbox::{DockerRuntime, EnvironmentManager, MountController};
use crate::tools::load_tool_definitions;

/// Exit status when the run finished but did not complete its task.
const EXIT_RUN_FAILED: i32 = 2;

pub async fn cmd_run(config_path: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let cfg = config::load_config(config_path.as_deref())?;
    let log_guard = crate::logging::init_logging(&cfg.log)?;

    let model_name = args.model.clone().unwrap_or_else(|| cfg.run.model.clone());
    let model_id = ModelId::parse(&model_name)?;
    let (api_key, api_base) = resolve_provider(&cfg, &model_id.provider)?;
    let model = build_model(&model_id, &api_key, api_base.as_deref())?;

    let mut bot_config = preset_for(&args)?;
    if !args.tools.is_empty() {
        let extra = load_tool_definitions(&args.tools)?;
        bot_config = bot_config.with_tools(extra);
    }

    let settings = cfg.sandbox.to_settings()?;
    let mounts = MountController::new(cfg.sandbox.approved_root_path())?
        .with_read_only_strategy(settings.read_only_strategy);
    let runtime = DockerRuntime::connect()
        .await
        .context("connecting to the Docker daemon")?;
    let manager = Arc::new(EnvironmentManager::new(Arc::new(runtime), settings));

    let task = Task::new(args.task.clone())
        .with_timeout(Duration::from_secs(args.timeout_secs.unwrap_or(cfg.run.timeout_secs)))
        .with_max_iterations(args.max_iterations.unwrap_or(cfg.run.max_iterations));

    info!(bot = %bot_config.kind, model = %model_id, "Starting run");
    let bot = MicroBot::new(model_id, model, manager, mounts, bot_config).with_options(cfg.run.to_loop_options());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping run");
                cancel.cancel();
            }
        })
    };

    let outcome = bot.run(task, cancel).await;
    ctrl_c.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            let code = e.code();
            drop(log_guard);
            anyhow::bail!("{} ({})", e, code);
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    let success = result.is_success();
    // flush file logs before a non-zero exit skips destructors
    drop(log_guard);
    if !success {
        std::process::exit(EXIT_RUN_FAILED);
    }
    Ok(())
}
