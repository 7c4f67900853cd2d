//! Integration tests for the task engine against fake CLI scripts.
//!
//! Each test writes a small shell script standing in for `claude` or
//! `codex`, points the config at it and waits for the task to settle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_console::config::GlobalConfig;
use agent_console::models::task::{Task, TaskKind, TaskStatus};
use agent_console::orchestrator::request::{
    ClaudeTaskRequest, CodexTaskRequest, ExternalTaskRequest,
};
use agent_console::orchestrator::TaskEngine;
use agent_console::persistence::{
    spawn_persister, FileSnapshotStore, PersistHandle, SnapshotSource, SnapshotStore,
};
use agent_console::AppError;

use super::test_helpers::{test_config, STEP_TIMEOUT};

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn engine(config: GlobalConfig) -> Arc<TaskEngine> {
    Arc::new(TaskEngine::new(Arc::new(config), PersistHandle::disabled()))
}

async fn settle(engine: &TaskEngine, id: &str) -> Task {
    tokio::time::timeout(STEP_TIMEOUT, engine.wait_terminal(id))
        .await
        .expect("task settles in time")
        .expect("task exists")
}

fn codex_request(prompt: &str) -> CodexTaskRequest {
    CodexTaskRequest {
        prompt: prompt.into(),
        ..CodexTaskRequest::default()
    }
}

// ── Claude ──────────────────────────────────────────────────────────────────

/// A missing MCP config file fails the task without spawning.
#[tokio::test]
async fn missing_mcp_config_fails_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));
    let missing = dir.path().join("nope").join("mcp.json");

    let task = engine
        .submit_claude(ClaudeTaskRequest {
            prompt: "hello".into(),
            mcp_config_path: Some(missing.display().to_string()),
            ..ClaudeTaskRequest::default()
        })
        .expect("task recorded");

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.exit_code, Some(-1));
    assert_eq!(
        task.logs,
        vec![format!("ERROR: MCP config file not found at {}", missing.display())]
    );
    assert_eq!(engine.get(&task.id).expect("stored").status, TaskStatus::Failed);
}

/// Without any MCP config path the submission is a configuration error.
#[tokio::test]
async fn absent_mcp_config_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));

    let err = engine
        .submit_claude(ClaudeTaskRequest {
            prompt: "hello".into(),
            ..ClaudeTaskRequest::default()
        })
        .expect_err("no mcp path");
    assert!(matches!(err, AppError::Config(_)));
    assert!(engine.list().is_empty());
}

/// Empty prompts are rejected before anything is recorded.
#[tokio::test]
async fn empty_prompt_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));
    let err = engine.submit_codex(codex_request("   ")).expect_err("empty prompt");
    assert!(matches!(err, AppError::Rejected(_)));
}

/// `json` output is parsed into result text and metadata at exit.
#[cfg(unix)]
#[tokio::test]
async fn claude_json_output_is_parsed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mcp = dir.path().join("mcp.json");
    std::fs::write(&mcp, "{}").expect("write mcp");
    let script = write_script(
        dir.path(),
        "claude",
        r#"echo '{"result":"all green","num_turns":2}'"#,
    );

    let mut config = test_config(dir.path());
    config.claude.program = script.display().to_string();
    config.claude.mcp_config_path = Some(mcp);
    config.claude.output_format = "json".into();
    let engine = engine(config);

    let task = engine
        .submit_claude(ClaudeTaskRequest {
            prompt: "check".into(),
            ..ClaudeTaskRequest::default()
        })
        .expect("submitted");
    assert!(task.command.contains("--output-format json"));

    let done = settle(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.result_text.as_deref(), Some("all green"));
    assert_eq!(done.result_meta.expect("meta")["num_turns"], 2);
    assert!(done.duration_ms.is_some());
}

/// A chat run logs each assistant block and answers with the joined text.
#[cfg(unix)]
#[tokio::test]
async fn claude_chat_collects_assistant_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mcp = dir.path().join("mcp.json");
    std::fs::write(&mcp, "{}").expect("write mcp");
    let script = write_script(
        dir.path(),
        "claude",
        r#"echo '{"type":"system","subtype":"init"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"fetching"}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"saved /tmp/cat.png"}]}}'
echo 'progress noise' >&2
echo '{"type":"result","result":"x","num_turns":3,"total_cost_usd":0.01}'"#,
    );
    let mut config = test_config(dir.path());
    config.claude.program = script.display().to_string();
    config.claude.mcp_config_path = Some(mcp);
    let engine = engine(config);

    let task = engine
        .submit_claude_chat(ClaudeTaskRequest {
            prompt: "draw a cat".into(),
            ..ClaudeTaskRequest::default()
        })
        .expect("submitted");
    assert_eq!(task.kind, Some(TaskKind::ClaudeChat));
    assert_eq!(task.status, TaskStatus::Running);

    let done = settle(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(
        done.logs,
        vec!["[CLAUDE CHAT] fetching", "[CLAUDE CHAT] saved /tmp/cat.png"]
    );
    assert_eq!(done.result_text.as_deref(), Some("fetching\nsaved /tmp/cat.png"));
    assert_eq!(
        done.result_meta.expect("meta"),
        json!({ "num_turns": 3, "total_cost_usd": 0.01 })
    );
    assert_eq!(done.files, vec!["/tmp/cat.png"]);
    assert!(done.stderr_bytes > 0);
}

/// A failing chat run logs the exit code as an error.
#[cfg(unix)]
#[tokio::test]
async fn claude_chat_nonzero_exit_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mcp = dir.path().join("mcp.json");
    std::fs::write(&mcp, "{}").expect("write mcp");
    let script = write_script(dir.path(), "claude", "exit 4");
    let mut config = test_config(dir.path());
    config.claude.program = script.display().to_string();
    config.claude.mcp_config_path = Some(mcp);
    let engine = engine(config);

    let task = engine
        .submit_claude_chat(ClaudeTaskRequest {
            prompt: "hi".into(),
            ..ClaudeTaskRequest::default()
        })
        .expect("submitted");
    let done = settle(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.logs.last().map(String::as_str), Some("[ERROR] Claude exited with code 4"));
}

/// Chat needs an existing MCP config file and records nothing without one.
#[tokio::test]
async fn claude_chat_requires_mcp_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));

    let err = engine
        .submit_claude_chat(ClaudeTaskRequest {
            prompt: "hi".into(),
            mcp_config_path: Some(dir.path().join("absent.json").display().to_string()),
            ..ClaudeTaskRequest::default()
        })
        .expect_err("missing mcp file");
    assert!(matches!(err, AppError::Task(_)));
    assert!(engine.list().is_empty());
}

// ── Codex ───────────────────────────────────────────────────────────────────

/// NDJSON events become prefixed logs, result text, artifacts and meta.
#[cfg(unix)]
#[tokio::test]
async fn codex_stream_is_accumulated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "codex",
        r#"echo '{"id":"0","msg":{"type":"task_started"}}'
echo '{"id":"1","msg":{"type":"agent_message","message":"wrote /tmp/report.md"}}'
echo '{"id":"2","msg":{"type":"token_count","info":{"total":7}}}'
echo 'plain stderr' >&2"#,
    );
    let mut config = test_config(dir.path());
    config.codex.program = script.display().to_string();
    let engine = engine(config);

    let task = engine.submit_codex(codex_request("summarize")).expect("submitted");
    let done = settle(&engine, &task.id).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result_text.as_deref(), Some("wrote /tmp/report.md"));
    assert!(done.logs.contains(&"[CODEX] Task started\n".to_owned()));
    assert!(done.logs.contains(&"[CODEX CHAT] wrote /tmp/report.md\n".to_owned()));
    assert!(done.logs.iter().any(|line| line.starts_with("[CODEX STDERR] plain stderr")));
    assert_eq!(done.files, vec!["/tmp/report.md"]);

    let meta = done.result_meta.expect("meta");
    assert_eq!(meta["provider"], "codex");
    assert_eq!(meta["token_usage"], json!({ "total": 7 }));
    assert_eq!(meta["exit_code"], 0);
    assert!(done.stdout_bytes > 0);
    assert!(done.stderr_bytes > 0);
}

/// A non-zero exit fails the task and records the exit as an error.
#[cfg(unix)]
#[tokio::test]
async fn codex_nonzero_exit_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "codex",
        r#"echo '{"id":"0","msg":{"type":"error","message":"quota exceeded"}}'
exit 2"#,
    );
    let mut config = test_config(dir.path());
    config.codex.program = script.display().to_string();
    let engine = engine(config);

    let task = engine.submit_codex(codex_request("go")).expect("submitted");
    let done = settle(&engine, &task.id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.exit_code, Some(2));
    assert_eq!(
        done.result_meta.expect("meta")["errors"],
        json!(["quota exceeded", "Codex exited with code 2"])
    );
}

/// A submitted run is reported as running before its child has started.
#[cfg(unix)]
#[tokio::test]
async fn submitted_task_is_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "codex", "sleep 0.2");
    let mut config = test_config(dir.path());
    config.codex.program = script.display().to_string();
    let engine = engine(config);

    let task = engine.submit_codex(codex_request("go")).expect("submitted");
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(engine.get(&task.id).expect("stored").status, TaskStatus::Running);
    assert_eq!(engine.stats().running, 1);

    let done = settle(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
}

/// A program that cannot be spawned fails with the synthetic exit code.
#[tokio::test]
async fn spawn_failure_is_recorded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.codex.program = dir.path().join("missing-codex").display().to_string();
    let engine = engine(config);

    let task = engine.submit_codex(codex_request("go")).expect("submitted");
    let done = settle(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.exit_code, Some(-1));
    assert!(done.logs[0].starts_with("Failed to start"), "{:?}", done.logs);
}

// ── External and manual done ────────────────────────────────────────────────

/// External tasks wait for their executor and then settle once.
#[tokio::test]
async fn external_task_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));

    let task = engine
        .register_external(ExternalTaskRequest {
            prompt: "run in terminal".into(),
            provider: Some("terminal".into()),
            ..ExternalTaskRequest::default()
        })
        .expect("registered");
    assert_eq!(task.status, TaskStatus::External);
    assert_eq!(engine.stats().external, 1);

    let waiter = {
        let engine = Arc::clone(&engine);
        let id = task.id.clone();
        tokio::spawn(async move { settle(&engine, &id).await })
    };

    let finished = engine
        .finish_external(&task.id, Some(0), Some("ok".into()))
        .expect("finished");
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(waiter.await.expect("join").result_text.as_deref(), Some("ok"));

    let again = engine.finish_external(&task.id, Some(1), None);
    assert!(matches!(again, Err(AppError::Rejected(_))));
    let missing = engine.finish_external("999", Some(0), None);
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

/// Manual done is refused on completed tasks and allowed otherwise.
#[tokio::test]
async fn manual_done_rules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(test_config(dir.path()));

    let open = engine
        .register_external(ExternalTaskRequest {
            prompt: "a".into(),
            ..ExternalTaskRequest::default()
        })
        .expect("registered");
    assert!(engine.mark_done(&open.id, true).expect("marked").manual_done);

    engine
        .finish_external(&open.id, Some(0), None)
        .expect("finished");
    assert!(matches!(
        engine.mark_done(&open.id, false),
        Err(AppError::Rejected(_))
    ));
    assert!(matches!(
        engine.mark_done("404", true),
        Err(AppError::NotFound(_))
    ));
}

// ── Persistence across restart ──────────────────────────────────────────────

/// Tasks written by one engine are restored by the next, with ids
/// continuing past the highest restored id.
#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path()));
    let store = Arc::new(FileSnapshotStore::new(config.tasks.state_file.clone()));

    let (persist, requests) = PersistHandle::channel();
    let first = Arc::new(TaskEngine::new(Arc::clone(&config), persist.clone()));
    let persister = spawn_persister(
        requests,
        Arc::clone(&first) as Arc<dyn SnapshotSource>,
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
        config.tasks.persist_debounce(),
        CancellationToken::new(),
    );

    let external = first
        .register_external(ExternalTaskRequest {
            prompt: "kept".into(),
            ..ExternalTaskRequest::default()
        })
        .expect("registered");
    let done = first
        .register_external(ExternalTaskRequest {
            prompt: "done".into(),
            ..ExternalTaskRequest::default()
        })
        .expect("registered");
    first
        .finish_external(&done.id, Some(0), Some("result".into()))
        .expect("finished");

    persist.shutdown().await;
    persister.await.expect("persister joins");
    assert!(first.persisted_at().is_some());

    let snapshot = store.load().await.expect("load").expect("snapshot present");
    let second = engine((*config).clone());
    assert_eq!(second.rehydrate(snapshot), 2);

    assert_eq!(
        second.get(&external.id).expect("restored").status,
        TaskStatus::External
    );
    let restored = second.get(&done.id).expect("restored");
    assert_eq!(restored.status, TaskStatus::Completed);
    assert_eq!(restored.result_text.as_deref(), Some("result"));
    assert!(second.persisted_at().is_some());

    let next = second
        .register_external(ExternalTaskRequest {
            prompt: "new".into(),
            ..ExternalTaskRequest::default()
        })
        .expect("registered");
    assert_eq!(next.id, "3");
}

/// A snapshot holding a running task restores it as interrupted.
#[tokio::test]
async fn running_task_is_interrupted_on_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    std::fs::write(
        &config.tasks.state_file,
        json!({
            "version": 2,
            "nextTaskId": 6,
            "tasks": [{ "id": 5, "status": "running", "prompt": "long job" }]
        })
        .to_string(),
    )
    .expect("write snapshot");

    let store = FileSnapshotStore::new(config.tasks.state_file.clone());
    let snapshot = store.load().await.expect("load").expect("snapshot present");
    let engine = engine(config);
    engine.rehydrate(snapshot);

    let task = engine.get("5").expect("restored");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.exit_code, Some(-1));
    assert_eq!(task.result_text.as_deref(), Some("interrupted by server restart"));
}

/// A missing or empty snapshot file loads as nothing.
#[tokio::test]
async fn empty_store_loads_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSnapshotStore::new(dir.path().join("absent.json"));
    assert!(store.load().await.expect("load").is_none());

    std::fs::write(store.path(), "  \n").expect("write");
    assert!(store.load().await.expect("load").is_none());

    std::fs::write(store.path(), "{ nope").expect("write");
    assert!(store.load().await.is_err());
}
