// Response protocol between the model and the agent loop

use crate::sandbox::CommandRequest;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Shown to the model in every system prompt.
pub const RESPONSE_FORMAT: &str = r#"```json
{
    "task_done": true | false,
    "command": "<shell command to execute>" | null,
    "result": "final result string" | null
}
```
Instead of "command" you may send "commands": a list of shell commands run in order. Each entry is either a string or {"command": "<shell command>", "timeout_secs": <seconds>}."#;

/// A decoded model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelResponse {
    /// Run these, in order, and report back.
    Commands(Vec<CommandRequest>),
    /// The task is finished.
    Complete { result: Option<String> },
}

/// Why a model reply could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("response is empty")]
    Empty,

    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response must be a JSON object")]
    NotAnObject,

    #[error("`task_done` must be a boolean")]
    TaskDoneNotBool,

    #[error("`task_done` is false but no command was given")]
    MissingCommand,

    #[error("`task_done` is true but a command was also given")]
    CommandWithCompletion,

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ProtocolError {
    /// Corrective instruction sent back to the model with the error.
    pub fn hint(&self) -> &'static str {
        match self {
            ProtocolError::Empty | ProtocolError::InvalidJson(_) | ProtocolError::NotAnObject => {
                "Reply with exactly one JSON object in the required format and nothing else."
            }
            ProtocolError::TaskDoneNotBool => "Set \"task_done\" to true or false.",
            ProtocolError::MissingCommand => {
                "Provide a non-empty \"command\", or set \"task_done\" to true with a \"result\"."
            }
            ProtocolError::CommandWithCompletion => {
                "When \"task_done\" is true, set \"command\" to null and put the answer in \"result\"."
            }
            ProtocolError::InvalidCommand(_) => {
                "Each command must be a non-empty string or {\"command\": \"...\", \"timeout_secs\": N} with N > 0."
            }
        }
    }
}

/// Pull the JSON payload out of a reply: the first fenced block if there is
/// one, otherwise the outermost braces, otherwise the trimmed text.
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // skip the info string (`json`, `JSON`, ...)
        let body = match after.find('\n') {
            Some(nl) => &after[nl + 1..],
            None => after,
        };
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    let trimmed = text.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(open), Some(close)) if open < close => &trimmed[open..=close],
        _ => trimmed,
    }
}

/// Decode and validate one model reply.
pub fn decode_response(text: &str) -> Result<ModelResponse, ProtocolError> {
    if text.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }
    let value: Value =
        serde_json::from_str(extract_json(text)).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let task_done = obj
        .get("task_done")
        .and_then(Value::as_bool)
        .ok_or(ProtocolError::TaskDoneNotBool)?;
    let commands = parse_commands(obj)?;

    if task_done {
        if !commands.is_empty() {
            return Err(ProtocolError::CommandWithCompletion);
        }
        let result = match obj.get("result") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Ok(ModelResponse::Complete { result })
    } else if commands.is_empty() {
        Err(ProtocolError::MissingCommand)
    } else {
        Ok(ModelResponse::Commands(commands))
    }
}

fn parse_commands(obj: &Map<String, Value>) -> Result<Vec<CommandRequest>, ProtocolError> {
    let single = obj.get("command").filter(|v| !v.is_null());
    let many = obj.get("commands").filter(|v| !v.is_null());

    match (single, many) {
        (Some(_), Some(_)) => Err(ProtocolError::InvalidCommand(
            "give either \"command\" or \"commands\", not both".to_string(),
        )),
        (Some(Value::String(s)), None) => Ok(non_blank(s).map(CommandRequest::new).into_iter().collect()),
        (Some(other), None) => Err(ProtocolError::InvalidCommand(format!(
            "\"command\" must be a string, got {}",
            other
        ))),
        (None, Some(Value::Array(items))) => items.iter().map(parse_entry).collect(),
        (None, Some(other)) => Err(ProtocolError::InvalidCommand(format!(
            "\"commands\" must be a list, got {}",
            other
        ))),
        (None, None) => Ok(Vec::new()),
    }
}

fn parse_entry(entry: &Value) -> Result<CommandRequest, ProtocolError> {
    match entry {
        Value::String(s) => non_blank(s)
            .map(CommandRequest::new)
            .ok_or_else(|| ProtocolError::InvalidCommand("empty command".to_string())),
        Value::Object(map) => {
            let command = map
                .get("command")
                .and_then(Value::as_str)
                .and_then(non_blank)
                .ok_or_else(|| ProtocolError::InvalidCommand("entry without a command".to_string()))?;
            let mut request = CommandRequest::new(command);
            if let Some(t) = map.get("timeout_secs").filter(|v| !v.is_null()) {
                let timeout = t
                    .as_f64()
                    .and_then(timeout_from_secs)
                    .ok_or_else(|| ProtocolError::InvalidCommand(format!("bad timeout_secs {}", t)))?;
                request = request.with_timeout(timeout);
            }
            Ok(request)
        }
        other => Err(ProtocolError::InvalidCommand(format!("unexpected entry {}", other))),
    }
}

/// A positive, representable timeout; `None` for zero, negative, NaN or huge values.
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
    } else {
        None
    }
}

fn non_blank(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Encode a reply in the wire format. Used when mapping native tool calls.
pub fn encode_response(response: &ModelResponse) -> String {
    let value = match response {
        ModelResponse::Complete { result } => serde_json::json!({
            "task_done": true,
            "command": null,
            "result": result,
        }),
        ModelResponse::Commands(commands) => {
            let entries: Vec<Value> = commands
                .iter()
                .map(|c| match c.timeout {
                    Some(t) => serde_json::json!({"command": c.command, "timeout_secs": t.as_secs_f64()}),
                    None => Value::String(c.command.clone()),
                })
                .collect();
            serde_json::json!({
                "task_done": false,
                "commands": entries,
                "result": null,
            })
        }
    };
    value.to_string()
}
