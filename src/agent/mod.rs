pub mod conversation;
pub mod r#loop;
pub mod prompt;
pub mod result;

use std::time::Duration;

pub use conversation::{Conversation, Turn};
pub use prompt::build_system_prompt;
pub use r#loop::{AgentLoop, LoopOptions, LoopOutcome, LoopReport, LoopState};
pub use result::{RunResult, RunStatus};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(200);
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
/// Longest timeout a task may ask for.
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What the model is asked to do, and how long it may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub instruction: String,
    pub timeout: Duration,
    pub max_iterations: u32,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            timeout: DEFAULT_TIMEOUT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.instruction.trim().is_empty() {
            return Err("task instruction is empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("task timeout must be greater than zero".to_string());
        }
        if self.timeout > MAX_TASK_TIMEOUT {
            return Err(format!(
                "task timeout of {}s exceeds the limit of {}s",
                self.timeout.as_secs(),
                MAX_TASK_TIMEOUT.as_secs()
            ));
        }
        if self.max_iterations == 0 {
            return Err("max iterations must be at least 1".to_string());
        }
        Ok(())
    }
}
