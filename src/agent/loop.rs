//! Agent loop -- drives model turns and command dispatch for one run.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::conversation::{Conversation, Turn};
use crate::agent::{Task, MAX_TASK_TIMEOUT};
use crate::llm::{decode_response, ModelCapability, ModelRequest, ModelResponse, ToolSpec};
use crate::sandbox::{CommandRequest, Environment, EnvironmentManager, SandboxError};

pub const DEFAULT_MAX_PROTOCOL_ERRORS: u32 = 3;

/// Loop policy that does not change between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    /// Consecutive malformed replies tolerated before the run fails.
    pub max_protocol_errors: u32,
    /// Send only the task plus the last N turns to the model.
    pub history_window: Option<usize>,
    /// Whether a turn whose commands all timed out uses up an iteration.
    pub count_timed_out_iterations: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_protocol_errors: DEFAULT_MAX_PROTOCOL_ERRORS,
            history_window: None,
            count_timed_out_iterations: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    AwaitingModel,
    DispatchingCommand,
    Complete,
    TimedOut,
    MaxIterations,
    Failed,
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Complete { result: Option<String> },
    TimedOut,
    MaxIterations,
    Failed { reason: String },
}

impl LoopOutcome {
    fn terminal_state(&self) -> LoopState {
        match self {
            LoopOutcome::Complete { .. } => LoopState::Complete,
            LoopOutcome::TimedOut => LoopState::TimedOut,
            LoopOutcome::MaxIterations => LoopState::MaxIterations,
            LoopOutcome::Failed { .. } => LoopState::Failed,
        }
    }
}

/// Everything the result extractor needs.
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub conversation: Conversation,
    pub iterations: u32,
    pub elapsed: Duration,
}

enum Dispatch {
    Done { all_timed_out: bool },
    Stop(LoopOutcome),
}

fn cancelled() -> LoopOutcome {
    LoopOutcome::Failed {
        reason: "run cancelled".to_string(),
    }
}

pub struct AgentLoop<'a> {
    manager: &'a EnvironmentManager,
    env: &'a Environment,
    model: &'a dyn ModelCapability,
    tools: Vec<ToolSpec>,
    options: LoopOptions,
    state: LoopState,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        manager: &'a EnvironmentManager,
        env: &'a Environment,
        model: &'a dyn ModelCapability,
        tools: Vec<ToolSpec>,
        options: LoopOptions,
    ) -> Self {
        Self {
            manager,
            env,
            model,
            tools,
            options,
            state: LoopState::Init,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(environment_id = %self.env.id(), from = ?self.state, to = ?next, "Loop transition");
            self.state = next;
        }
    }

    /// Run `task` until completion, a limit, a failure or cancellation.
    ///
    /// Every model call counts as one iteration, malformed replies included.
    /// The model call and every command are bounded by what is left of the
    /// task timeout and raced against `cancel`.
    pub async fn run(
        mut self,
        task: &Task,
        mut conversation: Conversation,
        cancel: &CancellationToken,
    ) -> LoopReport {
        let started = Instant::now();
        // unvalidated tasks may carry timeouts past what Instant can represent
        let deadline = started
            .checked_add(task.timeout)
            .unwrap_or_else(|| started + MAX_TASK_TIMEOUT);
        let mut iterations: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        info!(
            environment_id = %self.env.id(),
            timeout_secs = task.timeout.as_secs_f64(),
            max_iterations = task.max_iterations,
            "Agent loop started"
        );

        let outcome = loop {
            self.transition(LoopState::AwaitingModel);
            if cancel.is_cancelled() {
                break cancelled();
            }
            let now = Instant::now();
            if now >= deadline {
                break LoopOutcome::TimedOut;
            }
            if iterations >= task.max_iterations {
                break LoopOutcome::MaxIterations;
            }

            let request = ModelRequest {
                system_prompt: conversation.system_prompt().to_string(),
                messages: conversation.chat_messages(self.options.history_window),
                tools: self.tools.clone(),
            };
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => break cancelled(),
                r = tokio::time::timeout(deadline - now, self.model.complete(&request)) => r,
            };
            iterations += 1;
            debug!(environment_id = %self.env.id(), iteration = iterations, "Model replied");

            let text = match reply {
                Err(_) => break LoopOutcome::TimedOut,
                Ok(Err(e)) => {
                    error!(environment_id = %self.env.id(), error = %e, "Model call failed");
                    break LoopOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
                Ok(Ok(text)) => text,
            };
            conversation.push(Turn::ModelResponse { content: text.clone() });

            let commands = match decode_response(&text) {
                Ok(ModelResponse::Complete { result }) => break LoopOutcome::Complete { result },
                Ok(ModelResponse::Commands(commands)) => {
                    consecutive_errors = 0;
                    commands
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        environment_id = %self.env.id(),
                        error = %e,
                        consecutive = consecutive_errors,
                        "Malformed model response"
                    );
                    conversation.push(Turn::ProtocolError {
                        error: e.to_string(),
                        hint: e.hint().to_string(),
                    });
                    if consecutive_errors >= self.options.max_protocol_errors {
                        break LoopOutcome::Failed {
                            reason: format!(
                                "model produced {} consecutive malformed responses (last: {})",
                                consecutive_errors, e
                            ),
                        };
                    }
                    continue;
                }
            };

            self.transition(LoopState::DispatchingCommand);
            match self.dispatch(&commands, deadline, cancel, &mut conversation).await {
                Dispatch::Done { all_timed_out } => {
                    if all_timed_out && !self.options.count_timed_out_iterations {
                        iterations -= 1;
                    }
                }
                Dispatch::Stop(outcome) => break outcome,
            }
        };

        self.transition(outcome.terminal_state());
        let elapsed = started.elapsed();
        info!(
            environment_id = %self.env.id(),
            outcome = ?self.state,
            iterations,
            elapsed_ms = elapsed.as_millis() as u64,
            "Agent loop finished"
        );
        LoopReport {
            outcome,
            conversation,
            iterations,
            elapsed,
        }
    }

    async fn dispatch(
        &self,
        commands: &[CommandRequest],
        deadline: Instant,
        cancel: &CancellationToken,
        conversation: &mut Conversation,
    ) -> Dispatch {
        let mut all_timed_out = true;
        for request in commands {
            if cancel.is_cancelled() {
                return Dispatch::Stop(cancelled());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Dispatch::Stop(LoopOutcome::TimedOut);
            }
            let budget = request
                .timeout
                .unwrap_or(self.manager.settings().command_timeout)
                .min(remaining);
            let bounded = CommandRequest::new(request.command.clone()).with_timeout(budget);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Dispatch::Stop(cancelled()),
                r = self.manager.run_command(self.env, &bounded) => r,
            };
            match result {
                Ok(result) => {
                    all_timed_out &= result.timed_out;
                    debug!(
                        environment_id = %self.env.id(),
                        exit_code = result.exit_code,
                        timed_out = result.timed_out,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        "Command finished"
                    );
                    conversation.push(Turn::CommandObservation {
                        command: request.command.clone(),
                        result,
                    });
                }
                Err(SandboxError::EnvironmentLost(reason)) => {
                    return Dispatch::Stop(LoopOutcome::Failed {
                        reason: format!("environment lost: {}", reason),
                    });
                }
                Err(e) => {
                    return Dispatch::Stop(LoopOutcome::Failed { reason: e.to_string() });
                }
            }
        }
        Dispatch::Done { all_timed_out }
    }
}
