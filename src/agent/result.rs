//! Run results: what a caller gets back from a finished run.

use crate::agent::conversation::Turn;
use crate::agent::r#loop::{LoopOutcome, LoopReport};
use crate::agent::Task;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    TimedOut,
    MaxIterationsExceeded,
    Failed,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub iterations: u32,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub trace: Vec<Turn>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Build the result for a finished loop.
    pub fn from_report(report: LoopReport, task: &Task) -> Self {
        let (status, result, error) = match report.outcome {
            LoopOutcome::Complete { result } => (RunStatus::Completed, result, None),
            LoopOutcome::TimedOut => (
                RunStatus::TimedOut,
                None,
                Some(format!(
                    "Timeout of {} seconds reached",
                    task.timeout.as_secs_f64()
                )),
            ),
            LoopOutcome::MaxIterations => (
                RunStatus::MaxIterationsExceeded,
                None,
                Some(format!("Max iterations {} reached", task.max_iterations)),
            ),
            LoopOutcome::Failed { reason } => (RunStatus::Failed, None, Some(reason)),
        };
        Self {
            status,
            result,
            error,
            iterations: report.iterations,
            elapsed: report.elapsed,
            trace: report.conversation.into_turns(),
        }
    }

    /// Human-readable transcript of the run.
    pub fn render_trace(&self) -> String {
        let mut out = String::new();
        for (i, turn) in self.trace.iter().enumerate() {
            let label = match turn {
                Turn::System { .. } => "SYSTEM",
                Turn::Task { .. } => "TASK",
                Turn::ModelResponse { .. } => "MODEL",
                Turn::CommandObservation { .. } => "OBSERVATION",
                Turn::ProtocolError { .. } => "PROTOCOL ERROR",
                Turn::Notice { .. } => "NOTICE",
            };
            let _ = writeln!(out, "--- [{}] {} ---", i, label);
            let _ = writeln!(out, "{}", turn.render().trim_end());
        }
        let _ = write!(
            out,
            "=== {:?} after {} iteration(s) in {:.1}s",
            self.status,
            self.iterations,
            self.elapsed.as_secs_f64()
        );
        if let Some(error) = &self.error {
            let _ = write!(out, ": {}", error);
        }
        out.push('\n');
        out
    }
}
