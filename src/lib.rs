//! # microbots
//!
//! Run an LLM-driven shell agent against a host directory inside a
//! disposable Docker container. The directory is mounted with an explicit
//! permission: read-only mounts get a writable overlay inside the container,
//! so the agent can experiment without touching the host.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use microbots::agent::Task;
//! use microbots::bot::{presets, MicroBot};
//! use microbots::llm::{build_model, ModelId};
//! use microbots::sandbox::{DockerRuntime, EnvironmentManager, MountController, SandboxSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let model_id = ModelId::parse("anthropic/claude-sonnet-4-5")?;
//!     let model = build_model(&model_id, &std::env::var("ANTHROPIC_API_KEY")?, None)?;
//!     let runtime = DockerRuntime::connect().await?;
//!     let manager = Arc::new(EnvironmentManager::new(Arc::new(runtime), SandboxSettings::default()));
//!     let mounts = MountController::new("/home/me/projects")?;
//!
//!     let bot = MicroBot::new(model_id, model, manager, mounts, presets::reading("/home/me/projects/app"));
//!     let result = bot
//!         .run(Task::new("Summarize what this project does"), CancellationToken::new())
//!         .await?;
//!     println!("{:?}: {:?}", result.status, result.result);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sandbox`] - Container lifecycle, mounts and command execution
//! - [`tools`] - Tool definitions and in-container installation
//! - [`llm`] - Model abstraction, reply protocol and rig providers
//! - [`agent`] - The command loop and run results
//! - [`bot`] - Presets tying a mount, a role and tools together
//! - [`config`] - JSON configuration
//! - [`cli`] - Command-line entry point

pub mod agent;
pub mod bot;
pub mod cli;
pub mod config;
pub mod llm;
pub mod logging;
pub mod sandbox;
pub mod tools;
