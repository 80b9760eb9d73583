//! Append-only conversation trace for one run.

use crate::llm::{ChatMessage, Role};
use crate::sandbox::CommandResult;
use serde::{Deserialize, Serialize};

/// One entry in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    System { content: String },
    Task { content: String },
    ModelResponse { content: String },
    CommandObservation { command: String, result: CommandResult },
    ProtocolError { error: String, hint: String },
    Notice { content: String },
}

impl Turn {
    /// Who the model sees as the author. `None` for the system prompt.
    pub fn role(&self) -> Option<Role> {
        match self {
            Turn::System { .. } => None,
            Turn::ModelResponse { .. } => Some(Role::Assistant),
            Turn::Task { .. }
            | Turn::CommandObservation { .. }
            | Turn::ProtocolError { .. }
            | Turn::Notice { .. } => Some(Role::User),
        }
    }

    /// Text sent to the model for this turn.
    pub fn render(&self) -> String {
        match self {
            Turn::System { content }
            | Turn::Task { content }
            | Turn::ModelResponse { content }
            | Turn::Notice { content } => content.clone(),
            Turn::CommandObservation { command, result } => {
                format!("Command: {}\n{}", command, result.to_observation())
            }
            Turn::ProtocolError { error, hint } => {
                format!("Your last response could not be processed: {}. {}", error, hint)
            }
        }
    }
}

/// Ordered turns of one run. Starts with the system prompt and the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            turns: vec![
                Turn::System {
                    content: system_prompt.into(),
                },
                Turn::Task { content: task.into() },
            ],
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn system_prompt(&self) -> &str {
        self.turns
            .iter()
            .find_map(|t| match t {
                Turn::System { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    /// Messages for the next model call.
    ///
    /// With `window = Some(n)` the task turn is kept and only the last `n`
    /// turns after it are sent. Consecutive turns by the same author are
    /// merged so providers that require alternation accept the history.
    pub fn chat_messages(&self, window: Option<usize>) -> Vec<ChatMessage> {
        let visible: Vec<&Turn> = self.turns.iter().filter(|t| t.role().is_some()).collect();
        let selected: Vec<&Turn> = match (window, visible.split_first()) {
            (Some(n), Some((task, rest))) if rest.len() > n => {
                let mut kept = vec![*task];
                kept.extend_from_slice(&rest[rest.len() - n..]);
                kept
            }
            _ => visible,
        };

        let mut messages: Vec<ChatMessage> = Vec::with_capacity(selected.len());
        for turn in selected {
            let Some(role) = turn.role() else { continue };
            let text = turn.render();
            match messages.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&text);
                }
                _ => messages.push(ChatMessage { role, content: text }),
            }
        }
        messages
    }
}
