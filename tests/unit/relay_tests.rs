//! Unit tests for bridge event relaying and the cursor-position shim.

use bytes::Bytes;
use serde_json::json;

use agent_console::pty::bridge::BridgeEvent;
use agent_console::pty::relay::{
    contains_cursor_query, relay_event, SessionIdentity, CURSOR_POSITION_REPLY,
};
use agent_console::ws::messages::ServerEvent;

fn identity() -> SessionIdentity {
    SessionIdentity {
        session_id: "s-1".into(),
        command: "codex".into(),
        args: vec!["--help".into()],
    }
}

/// `ready` carries the session identity and pid.
#[test]
fn ready_carries_identity() {
    let relay = relay_event(&identity(), BridgeEvent::Ready { pid: Some(42) });
    assert_eq!(
        relay.event,
        Some(ServerEvent::Ready {
            session_id: "s-1".into(),
            command: "codex".into(),
            args: vec!["--help".into()],
            pid: Some(42),
        })
    );
    assert!(!relay.close);
    assert!(relay.reply.is_none());
}

/// A cursor query in the output is answered locally.
#[test]
fn cursor_query_gets_canned_reply() {
    let relay = relay_event(
        &identity(),
        BridgeEvent::Output {
            data: "G1s2bg==".into(),
            bytes: Bytes::from_static(b"\x1b[6n"),
        },
    );
    assert_eq!(relay.reply, Some(CURSOR_POSITION_REPLY));
    assert_eq!(
        relay.event,
        Some(ServerEvent::Output {
            data: "G1s2bg==".into()
        })
    );
}

/// Plain output passes through without a reply.
#[test]
fn plain_output_has_no_reply() {
    let relay = relay_event(
        &identity(),
        BridgeEvent::Output {
            data: "aGk=".into(),
            bytes: Bytes::from_static(b"hi"),
        },
    );
    assert!(relay.reply.is_none());
    assert!(!contains_cursor_query(b"\x1b[6"));
    assert!(contains_cursor_query(b"abc\x1b[6nxyz"));
}

/// `exit` closes the connection after the event.
#[test]
fn exit_closes_connection() {
    let relay = relay_event(
        &identity(),
        BridgeEvent::Exit {
            exit_code: None,
            signal: Some(json!(15)),
        },
    );
    assert!(relay.close);
    assert_eq!(
        relay.event,
        Some(ServerEvent::Exit {
            exit_code: None,
            signal: Some(json!(15)),
        })
    );
}

/// Pong without a timestamp echoes null; debug and stderr stay server-side.
#[test]
fn pong_and_silent_events() {
    let pong = relay_event(&identity(), BridgeEvent::Pong { ts: None });
    assert_eq!(
        pong.event,
        Some(ServerEvent::Pong {
            ts: serde_json::Value::Null
        })
    );

    assert!(relay_event(&identity(), BridgeEvent::Debug(json!({"type":"x"})))
        .event
        .is_none());
    assert!(relay_event(&identity(), BridgeEvent::Stderr("warn".into()))
        .event
        .is_none());
}
