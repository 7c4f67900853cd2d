//! Unit tests for the live session registry.

use chrono::{Duration, Utc};

use agent_console::pty::registry::{SessionRegistry, SessionSummary};
use agent_console::AppError;

fn summary(id: &str, connection: &str, offset_ms: i64) -> SessionSummary {
    SessionSummary {
        id: id.into(),
        command: "claude".into(),
        args: Vec::new(),
        pid: None,
        connection_id: connection.into(),
        started_at: Utc::now() + Duration::milliseconds(offset_ms),
        ready: false,
    }
}

/// One session per connection.
#[test]
fn second_session_on_connection_is_rejected() {
    let registry = SessionRegistry::new();
    let _guard = registry.attach(summary("s1", "c1", 0)).expect("attach");
    let err = registry.attach(summary("s2", "c1", 0)).expect_err("duplicate");
    assert!(matches!(err, AppError::Rejected(_)));
    assert_eq!(registry.len(), 1);
}

/// Dropping the guard removes the entry.
#[test]
fn dropping_guard_unregisters() {
    let registry = SessionRegistry::new();
    let guard = registry.attach(summary("s1", "c1", 0)).expect("attach");
    assert_eq!(guard.id(), "s1");
    drop(guard);
    assert!(registry.is_empty());
    assert!(!registry.stop("s1"));
}

/// `stop` cancels the guard's token.
#[test]
fn stop_cancels_token() {
    let registry = SessionRegistry::new();
    let guard = registry.attach(summary("s1", "c1", 0)).expect("attach");
    let token = guard.stop_token();
    assert!(!token.is_cancelled());
    assert!(registry.stop("s1"));
    assert!(token.is_cancelled());
}

/// Readiness and pid are recorded; listing is oldest first.
#[test]
fn list_orders_and_reflects_readiness() {
    let registry = SessionRegistry::new();
    let _late = registry.attach(summary("late", "c2", 500)).expect("attach");
    let _early = registry.attach(summary("early", "c1", 0)).expect("attach");
    registry.mark_ready("late", Some(4321));

    let list = registry.list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, "early");
    assert_eq!(list[1].id, "late");
    assert!(list[1].ready);
    assert_eq!(list[1].pid, Some(4321));

    let value = serde_json::to_value(&list[1]).expect("serialize");
    assert_eq!(value["connectionId"], "c2");
    assert!(value["startedAt"].is_string());
}
