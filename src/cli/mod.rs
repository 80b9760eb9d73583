//! CLI commands module.

mod helpers;
mod init_config;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::bot::{BotKind, Collect};

pub use init_config::cmd_init_config;
pub use run::cmd_run;

#[derive(Parser)]
#[command(name = "microbots", version, about = "microbots: sandboxed LLM shell agents")]
struct Cli {
    /// Config file (default: ~/.microbots/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task with a bot and print the result as JSON.
    Run(RunArgs),

    /// Write a config file with default values.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Bot preset.
    #[arg(long, value_enum, default_value_t = BotKind::Reading)]
    pub bot: BotKind,

    /// Model as "<provider>/<deployment>", e.g. "anthropic/claude-sonnet-4-5".
    #[arg(long)]
    pub model: Option<String>,

    /// Host directory to mount into the sandbox.
    #[arg(long)]
    pub mount: Option<PathBuf>,

    /// Log file to analyze (log-analysis bot), relative to the mount or absolute.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Task instruction.
    #[arg(long, short)]
    pub task: String,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Extra tool definition files (JSON); may be repeated.
    #[arg(long = "tool")]
    pub tools: Vec<PathBuf>,

    /// Role prompt for the custom bot.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Host file or directory to copy into the working directory; may be repeated.
    #[arg(long = "copy")]
    pub copies: Vec<PathBuf>,

    /// "<container path>=<host dir>" to copy out after the run; may be repeated.
    #[arg(long = "collect", value_parser = helpers::parse_collect)]
    pub collect: Vec<Collect>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(cli.config, args).await,
        Commands::InitConfig { force } => cmd_init_config(cli.config, force),
    }
}

#[cfg(test)]
pub(crate) fn parse_run_args(argv: &[&str]) -> RunArgs {
    match Cli::try_parse_from(argv).unwrap().command {
        Commands::Run(args) => args,
        _ => panic!("expected run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments() {
        let args = parse_run_args(&[
            "microbots", "run", "--bot", "log-analysis", "--mount", "/srv/app", "--log-file", "app.log",
            "--task", "why did it fail", "--tool", "a.json", "--tool", "b.json",
        ]);
        assert_eq!(args.bot, BotKind::LogAnalysis);
        assert_eq!(args.tools.len(), 2);
        assert_eq!(args.log_file, Some(PathBuf::from("app.log")));
        assert!(args.copies.is_empty());
    }

    #[test]
    fn copy_and_collect_arguments() {
        let args = parse_run_args(&[
            "microbots", "run", "--bot", "custom", "--system-prompt", "x", "--task", "t",
            "--copy", "/srv/data", "--copy", "notes.md", "--collect", "/workdir/out=./results",
        ]);
        assert_eq!(args.copies, vec![PathBuf::from("/srv/data"), PathBuf::from("notes.md")]);
        assert_eq!(
            args.collect,
            vec![Collect {
                from: "/workdir/out".to_string(),
                to: PathBuf::from("./results"),
            }]
        );
        assert!(Cli::try_parse_from(["microbots", "run", "--task", "t", "--collect", "relative=./x"]).is_err());
    }

    #[test]
    fn init_config_with_global_config_flag() {
        let cli = Cli::try_parse_from(["microbots", "init-config", "--force", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }
}
