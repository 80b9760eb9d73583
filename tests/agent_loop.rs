mod common;

use common::{batch_reply, command_reply, done_reply, FakeRuntime, ScriptedModel};
use microbots::agent::{AgentLoop, Conversation, LoopOptions, LoopOutcome, RunResult, RunStatus, Task, Turn};
use microbots::llm::ToolSpec;
use microbots::sandbox::{Environment, EnvironmentManager, SandboxSettings};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

async fn setup() -> (Arc<FakeRuntime>, EnvironmentManager, Arc<Environment>) {
    setup_with(FakeRuntime::new(), SandboxSettings::default()).await
}

async fn setup_with(
    runtime: FakeRuntime,
    settings: SandboxSettings,
) -> (Arc<FakeRuntime>, EnvironmentManager, Arc<Environment>) {
    let runtime = Arc::new(runtime);
    let manager = EnvironmentManager::new(runtime.clone(), settings);
    let env = manager.create(None).await.unwrap();
    (runtime, manager, env)
}

fn observed(result: &RunResult) -> Vec<String> {
    result
        .trace
        .iter()
        .filter_map(|t| match t {
            Turn::CommandObservation { command, .. } => Some(command.clone()),
            _ => None,
        })
        .collect()
}

async fn run_loop(
    manager: &EnvironmentManager,
    env: &Environment,
    model: &ScriptedModel,
    task: &Task,
    options: LoopOptions,
    cancel: &CancellationToken,
) -> RunResult {
    let conversation = Conversation::new("system", task.instruction.clone());
    let report = AgentLoop::new(
        manager,
        env,
        model,
        vec![ToolSpec::run_command(), ToolSpec::complete_task()],
        options,
    )
    .run(task, conversation, cancel)
    .await;
    RunResult::from_report(report, task)
}

fn protocol_errors(result: &RunResult) -> usize {
    result
        .trace
        .iter()
        .filter(|t| matches!(t, Turn::ProtocolError { .. }))
        .count()
}

#[tokio::test]
async fn test_completes_after_one_command() {
    let (runtime, manager, env) = setup().await;
    let model = ScriptedModel::new([command_reply("ls -la"), done_reply("two files")]);
    let task = Task::new("list the files");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.result.as_deref(), Some("two files"));
    assert_eq!(result.iterations, 2);
    assert!(runtime.commands().iter().any(|c| c == "ls -la"));
    assert!(result
        .trace
        .iter()
        .any(|t| matches!(t, Turn::CommandObservation { command, .. } if command == "ls -la")));
}

#[tokio::test]
async fn test_slow_command_hits_task_timeout() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::repeating(command_reply("sleep 30"));
    let task = Task::new("wait forever").with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::TimedOut);
    assert_eq!(result.error.as_deref(), Some("Timeout of 1 seconds reached"));
    assert!(started.elapsed() < Duration::from_secs(10));
    let timed_out = result.trace.iter().any(|t| match t {
        Turn::CommandObservation { result, .. } => result.timed_out,
        _ => false,
    });
    assert!(timed_out);
}

#[tokio::test]
async fn test_max_iterations_stops_the_loop() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::repeating(command_reply("echo again"));
    let task = Task::new("never finish").with_max_iterations(3);

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::MaxIterationsExceeded);
    assert_eq!(result.error.as_deref(), Some("Max iterations 3 reached"));
    assert_eq!(result.iterations, 3);
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn test_malformed_reply_is_reported_back() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::new(["this is not json".to_string(), done_reply("fixed")]);
    let task = Task::new("answer");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.result.as_deref(), Some("fixed"));
    assert_eq!(protocol_errors(&result), 1);
    assert_eq!(result.iterations, 2);

    // The second call saw the error feedback.
    let requests = model.requests.lock().unwrap();
    let last = requests[1].messages.last().unwrap();
    assert!(last.content.contains("not valid JSON"));
}

#[tokio::test]
async fn test_consecutive_malformed_replies_fail_the_run() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::repeating("{\"task_done\": \"maybe\"}");
    let task = Task::new("answer");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(model.calls(), 3);
    assert_eq!(protocol_errors(&result), 3);
}

#[tokio::test]
async fn test_model_error_fails_the_run() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::new(Vec::<String>::new());
    let task = Task::new("answer");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("empty response"));
}

#[tokio::test]
async fn test_cancellation_interrupts_a_running_command() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::repeating(command_reply("sleep 30"));
    let task = Task::new("wait");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &cancel).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("run cancelled"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_history_window_keeps_task_turn() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::new([
        command_reply("echo 1"),
        command_reply("echo 2"),
        command_reply("echo 3"),
        done_reply("done"),
    ]);
    let task = Task::new("count to three");
    let options = LoopOptions {
        history_window: Some(2),
        ..LoopOptions::default()
    };

    let result = run_loop(&manager, &env, &model, &task, options, &CancellationToken::new()).await;
    assert_eq!(result.status, RunStatus::Completed);

    let requests = model.requests.lock().unwrap();
    let last = requests.last().unwrap();
    assert!(last.messages[0].content.contains("count to three"));
    assert!(last.messages.len() <= 3);
}

#[tokio::test]
async fn test_loop_outcome_matches_status() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::new([done_reply("immediately")]);
    let task = Task::new("answer");
    let conversation = Conversation::new("system", "answer");

    let report = AgentLoop::new(&manager, &env, &model, Vec::new(), LoopOptions::default())
        .run(&task, conversation, &CancellationToken::new())
        .await;

    assert_eq!(
        report.outcome,
        LoopOutcome::Complete {
            result: Some("immediately".to_string())
        }
    );
    assert_eq!(report.iterations, 1);
}

#[tokio::test]
async fn test_lost_environment_stops_the_rest_of_the_batch() {
    let (runtime, manager, env) = setup_with(FakeRuntime::lost_on("lost-marker"), SandboxSettings::default()).await;
    let model = ScriptedModel::new([batch_reply(&["echo a", "lost-marker", "echo c"]), done_reply("unreachable")]);
    let task = Task::new("run three things");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("environment lost"));
    assert_eq!(model.calls(), 1);
    let ran = runtime.commands();
    let a = ran.iter().position(|c| c == "echo a").unwrap();
    let lost = ran.iter().position(|c| c == "lost-marker").unwrap();
    assert!(a < lost);
    assert!(!ran.iter().any(|c| c == "echo c"));
    assert_eq!(observed(&result), vec!["echo a".to_string()]);
}

#[tokio::test]
async fn test_runtime_rejection_is_not_a_lost_environment() {
    let runtime = FakeRuntime {
        api_error_on: vec!["rejected-marker".to_string()],
        ..FakeRuntime::default()
    };
    let (_runtime, manager, env) = setup_with(runtime, SandboxSettings::default()).await;
    let model = ScriptedModel::new([command_reply("rejected-marker"), done_reply("unreachable")]);
    let task = Task::new("run it");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.unwrap();
    assert!(!error.contains("environment lost"));
    assert!(error.contains("exec create rejected"));
}

#[tokio::test]
async fn test_flooding_command_output_is_capped() {
    let settings = SandboxSettings {
        max_output_bytes: 1024,
        ..SandboxSettings::default()
    };
    let (_runtime, manager, env) = setup_with(FakeRuntime::new(), settings).await;
    let model = ScriptedModel::new([command_reply("flood 1000000"), done_reply("done")]);
    let task = Task::new("print a lot");

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Completed);
    let stdout = result
        .trace
        .iter()
        .find_map(|t| match t {
            Turn::CommandObservation { result, .. } => Some(result.stdout.clone()),
            _ => None,
        })
        .unwrap();
    assert!(stdout.len() < 2048);
    assert!(stdout.contains(&format!("[truncated {} bytes]", 1_000_000 - 1024)));
}

#[tokio::test]
async fn test_unbounded_timeout_does_not_overflow_the_deadline() {
    let (_runtime, manager, env) = setup().await;
    let model = ScriptedModel::new([command_reply("ls"), done_reply("fine")]);
    let task = Task::new("list").with_timeout(Duration::from_secs(u64::MAX));

    let result = run_loop(&manager, &env, &model, &task, LoopOptions::default(), &CancellationToken::new()).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.result.as_deref(), Some("fine"));
}
