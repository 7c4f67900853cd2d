//! Unit tests for the client-facing task projection.

use chrono::Utc;
use serde_json::json;

use agent_console::http::tasks::{prompt_preview, TaskView};
use agent_console::models::task::{Task, TaskKind};

/// The preview takes the first non-empty line and shortens it.
#[test]
fn preview_uses_first_line() {
    assert_eq!(prompt_preview("\n  \nfix tests\nmore", 12), "fix tests");
    assert_eq!(prompt_preview("refactor the parser", 12), "refactor th…");
    assert_eq!(prompt_preview("", 12), "");
    assert_eq!(prompt_preview("exactly12chr", 12), "exactly12chr");
}

/// The summary view omits output tails; the detailed view flattens them in.
#[test]
fn detail_fields_only_when_requested() {
    let mut task = Task::new(
        "3".into(),
        "hello".into(),
        "codex exec".into(),
        TaskKind::CodexExec,
        Utc::now(),
    );
    task.push_log("first", Utc::now());
    task.push_log("second", Utc::now());
    task.stdout = "out".into();
    task.result_meta = Some(json!({ "num_turns": 4 }));

    let summary = serde_json::to_value(TaskView::new(&task, false)).expect("serialize");
    assert_eq!(summary["id"], "3");
    assert_eq!(summary["type"], "codex_exec");
    assert_eq!(summary["status"], "pending");
    assert_eq!(summary["numTurns"], 4);
    assert_eq!(summary["promptPreview"], "hello");
    assert!(summary.get("logs").is_none());
    assert!(summary.get("resultMeta").is_none());

    let detailed = serde_json::to_value(TaskView::new(&task, true)).expect("serialize");
    assert_eq!(detailed["logs"], "first\nsecond");
    assert_eq!(detailed["stdout"], "out");
    assert_eq!(detailed["resultMeta"]["num_turns"], 4);
}
