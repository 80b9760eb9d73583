//! Rig-core bridge: run the agent's model calls through rig 0.30 providers.
//!
//! Providers are selected by the `<provider>` half of a [`ModelId`]. Native
//! tool calls are folded back into the JSON reply format so the loop only ever
//! decodes one protocol.

use super::protocol::{encode_response, timeout_from_secs, ModelResponse};
use super::{ModelCapability, ModelError, ModelId, ModelRequest, Role, COMPLETE_TASK_TOOL, RUN_COMMAND_TOOL};
use crate::sandbox::CommandRequest;
use anyhow::Result;
use async_trait::async_trait;
use rig::client::{CompletionClient, Nothing};
use rig::completion::{CompletionModel, ToolDefinition};
use rig::message::{AssistantContent, Message};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const MAX_TOKENS: u64 = 4096;

/// Adapter from a rig completion model to [`ModelCapability`].
#[derive(Clone)]
pub struct RigModel<M> {
    model: M,
    label: String,
}

impl<M: CompletionModel> RigModel<M> {
    pub fn new(model: M, label: impl Into<String>) -> Self {
        Self {
            model,
            label: label.into(),
        }
    }
}

/// Build a model for `id` with the given credentials.
pub fn build_model(id: &ModelId, api_key: &str, api_base: Option<&str>) -> Result<Arc<dyn ModelCapability>> {
    let base = api_base.filter(|b| !b.is_empty());
    let label = id.to_string();
    let name = id.deployment.clone();
    // Turbofish `<reqwest::Client>` pins the http client type for the builders.
    type RC = reqwest::Client;

    let model: Arc<dyn ModelCapability> = match id.provider.as_str() {
        "anthropic" => {
            let mut builder = rig::providers::anthropic::Client::<RC>::builder()
                .api_key(api_key.to_string())
                .http_client(reqwest::Client::new());
            if let Some(base) = base {
                builder = builder.base_url(base);
            }
            let client = builder.build().map_err(|e| anyhow::anyhow!("{}", e))?;
            Arc::new(RigModel::new(client.completion_model(name), label))
        }
        "deepseek" => {
            let client = rig::providers::deepseek::Client::<RC>::builder()
                .api_key(api_key.to_string())
                .http_client(reqwest::Client::new())
                .build()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            Arc::new(RigModel::new(client.completion_model(name), label))
        }
        "moonshot" => {
            let client = rig::providers::moonshot::Client::<RC>::builder()
                .api_key(api_key.to_string())
                .http_client(reqwest::Client::new())
                .build()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            Arc::new(RigModel::new(client.completion_model(name), label))
        }
        "ollama" => {
            let mut builder = rig::providers::ollama::Client::<RC>::builder()
                .api_key(Nothing)
                .http_client(reqwest::Client::new());
            if let Some(base) = base {
                builder = builder.base_url(base);
            }
            let client = builder.build().map_err(|e| anyhow::anyhow!("{}", e))?;
            Arc::new(RigModel::new(client.completion_model(name), label))
        }
        "openai" | "openrouter" => {
            let mut builder = rig::providers::openai::Client::<RC>::builder()
                .api_key(api_key.to_string())
                .http_client(reqwest::Client::new());
            if let Some(base) = base {
                builder = builder.base_url(base);
            } else if id.provider == "openrouter" {
                builder = builder.base_url("https://openrouter.ai/api/v1");
            }
            let client = builder.build().map_err(|e| anyhow::anyhow!("{}", e))?;
            Arc::new(RigModel::new(client.completion_model(name), label))
        }
        other => anyhow::bail!(
            "unsupported model provider '{}' (expected anthropic, openai, openrouter, deepseek, moonshot or ollama)",
            other
        ),
    };
    Ok(model)
}

fn to_rig_message(role: Role, content: &str) -> Message {
    match role {
        Role::User => Message::user(content),
        Role::Assistant => Message::assistant(content),
    }
}

/// Turn a native tool call into a command, if it maps onto one.
fn tool_call_to_command(name: &str, args: &Value, installed: &[String]) -> Option<CommandRequest> {
    if name == RUN_COMMAND_TOOL {
        let command = args.get("command")?.as_str()?.to_string();
        let mut request = CommandRequest::new(command);
        if let Some(timeout) = args.get("timeout_secs").and_then(Value::as_f64).and_then(timeout_from_secs) {
            request = request.with_timeout(timeout);
        }
        return Some(request);
    }
    if installed.iter().any(|t| t == name) {
        let extra = args.get("args").and_then(Value::as_str).unwrap_or("");
        return Some(CommandRequest::new(format!("{} {}", name, extra).trim_end().to_string()));
    }
    None
}

#[async_trait]
impl<M> ModelCapability for RigModel<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let (last, history) = request
            .messages
            .split_last()
            .ok_or_else(|| ModelError::Request("no messages to send".to_string()))?;
        let prompt = to_rig_message(last.role, &last.content);
        let history: Vec<Message> = history.iter().map(|m| to_rig_message(m.role, &m.content)).collect();
        let tools: Vec<ToolDefinition> = request
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        debug!(model = %self.label, messages = request.messages.len(), "Sending completion request");
        let response = self
            .model
            .completion_request(prompt)
            .preamble(request.system_prompt.clone())
            .messages(history)
            .tools(tools)
            .max_tokens(MAX_TOKENS)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let installed: Vec<String> = request
            .tools
            .iter()
            .map(|t| t.name.clone())
            .filter(|n| n != RUN_COMMAND_TOOL && n != COMPLETE_TASK_TOOL)
            .collect();

        let mut text_parts = Vec::new();
        let mut commands = Vec::new();
        let mut completion: Option<Option<String>> = None;
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(t) => text_parts.push(t.text.clone()),
                AssistantContent::ToolCall(call) => {
                    let name = call.function.name.as_str();
                    let args = &call.function.arguments;
                    if name == COMPLETE_TASK_TOOL {
                        let result = args.get("result").map(|r| match r {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                        completion = Some(result);
                    } else if let Some(cmd) = tool_call_to_command(name, args, &installed) {
                        commands.push(cmd);
                    } else {
                        debug!(model = %self.label, tool = %name, "Ignoring unknown tool call");
                    }
                }
                _ => {}
            }
        }

        if !commands.is_empty() {
            return Ok(encode_response(&ModelResponse::Commands(commands)));
        }
        if let Some(result) = completion {
            return Ok(encode_response(&ModelResponse::Complete { result }));
        }
        let text = text_parts.join("\n");
        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(text)
    }
}
