//! Model capability: the only thing the agent loop knows about an LLM.
//!
//! A model takes the system prompt, the conversation so far and the tool
//! schema, and returns raw text. The text is decoded by [`protocol`].

pub mod protocol;
pub mod rig_model;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::sandbox::SandboxError;

pub use protocol::{decode_response, ModelResponse, ProtocolError, RESPONSE_FORMAT};
pub use rig_model::{build_model, RigModel};

/// Name of the native tool that maps onto a shell command.
pub const RUN_COMMAND_TOOL: &str = "run_command";
/// Name of the native tool that maps onto task completion.
pub const COMPLETE_TASK_TOOL: &str = "complete_task";

/// Errors from the model transport. Any of these fails the run.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model is not configured: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A native tool advertised to models that support tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    /// `run_command {command, timeout_secs?}`
    pub fn run_command() -> Self {
        Self {
            name: RUN_COMMAND_TOOL.to_string(),
            description: "Run a shell command in the sandbox and return its exit code, stdout and stderr."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute"},
                    "timeout_secs": {"type": "number", "description": "Optional deadline for this command"}
                },
                "required": ["command"]
            }),
        }
    }

    /// `complete_task {result}`
    pub fn complete_task() -> Self {
        Self {
            name: COMPLETE_TASK_TOOL.to_string(),
            description: "Finish the task and report the final result.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "result": {"type": "string", "description": "Final answer for the task"}
                },
                "required": ["result"]
            }),
        }
    }
}

/// Everything one model call sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system_prompt: String,
    /// Oldest first; never empty, the first entry is the task.
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// An LLM the agent loop can drive.
#[async_trait]
pub trait ModelCapability: Send + Sync {
    /// Return the model's raw reply to `request`.
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// `<provider>/<deployment>`, e.g. `openai/gpt-4o`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub provider: String,
    pub deployment: String,
}

impl ModelId {
    pub fn parse(s: &str) -> Result<Self, SandboxError> {
        let invalid = || {
            SandboxError::Configuration(format!(
                "model '{}' must have the form <provider>/<deployment>",
                s
            ))
        };
        let (provider, deployment) = s.trim().split_once('/').ok_or_else(invalid)?;
        if provider.is_empty() || deployment.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            provider: provider.to_lowercase(),
            deployment: deployment.to_string(),
        })
    }
}

impl FromStr for ModelId {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_parse() {
        let id = ModelId::parse("OpenAI/gpt-4o").unwrap();
        assert_eq!(id.provider, "openai");
        assert_eq!(id.deployment, "gpt-4o");
        assert_eq!(id.to_string(), "openai/gpt-4o");

        // deployments may themselves contain slashes
        let id = ModelId::parse("ollama/library/qwen3:8b").unwrap();
        assert_eq!(id.deployment, "library/qwen3:8b");
    }

    #[test]
    fn test_model_id_rejects_malformed() {
        for bad in ["gpt-4o", "/gpt-4o", "openai/", ""] {
            assert!(
                matches!(ModelId::parse(bad), Err(SandboxError::Configuration(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_run_command_schema_requires_command() {
        let spec = ToolSpec::run_command();
        assert_eq!(spec.parameters["required"][0], "command");
    }
}
