// Benchmarks for the per-iteration hot paths that do not need Docker:
// 1. Decoding model replies
// 2. Planning mounts
// 3. Building the message list from a long conversation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use microbots::agent::{Conversation, Turn};
use microbots::llm::decode_response;
use microbots::sandbox::{CommandResult, MountController, Permission};
use std::time::Duration;

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");
    let plain = r#"{"task_done": false, "command": "grep -rn TODO src | head -50", "result": null}"#;
    let fenced = format!(
        "I'll look for TODO markers first.\n```json\n{}\n```\nThen I'll summarize.",
        plain
    );
    let many = serde_json::json!({
        "task_done": false,
        "commands": (0..20).map(|i| serde_json::json!({"command": format!("cat file{}.txt", i), "timeout_secs": 5})).collect::<Vec<_>>(),
        "result": null
    })
    .to_string();

    group.bench_function("plain", |b| b.iter(|| decode_response(black_box(plain))));
    group.bench_function("fenced", |b| b.iter(|| decode_response(black_box(&fenced))));
    group.bench_function("twenty_commands", |b| b.iter(|| decode_response(black_box(&many))));
    group.finish();
}

fn bench_mount_planning(c: &mut Criterion) {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("project");
    std::fs::create_dir(&dir).expect("create project dir");
    let controller = MountController::new(root.path()).expect("controller");

    let mut group = c.benchmark_group("mount_planning");
    for permission in [Permission::ReadOnly, Permission::ReadWrite] {
        group.bench_with_input(BenchmarkId::from_parameter(permission), &permission, |b, p| {
            b.iter(|| controller.plan(black_box(&dir), *p).expect("plan"))
        });
    }
    group.finish();
}

fn bench_chat_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("chat_messages");
    for turns in [10usize, 100, 1000] {
        let mut conversation = Conversation::new("system prompt", "task");
        for i in 0..turns {
            conversation.push(Turn::ModelResponse {
                content: format!(r#"{{"task_done": false, "command": "echo {}"}}"#, i),
            });
            conversation.push(Turn::CommandObservation {
                command: format!("echo {}", i),
                result: CommandResult {
                    stdout: "x".repeat(512),
                    stderr: String::new(),
                    exit_code: 0,
                    elapsed: Duration::from_millis(3),
                    timed_out: false,
                },
            });
        }
        group.bench_with_input(BenchmarkId::new("full", turns), &conversation, |b, conv| {
            b.iter(|| conv.chat_messages(None))
        });
        group.bench_with_input(BenchmarkId::new("window_20", turns), &conversation, |b, conv| {
            b.iter(|| conv.chat_messages(Some(20)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode_response, bench_mount_planning, bench_chat_messages);
criterion_main!(benches);
