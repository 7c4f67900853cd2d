//! Unit tests for client control messages and server events.

use serde_json::json;

use agent_console::ws::messages::{ClientMessage, MessageError, ServerEvent, StringOrList};

// ── Parsing ─────────────────────────────────────────────────────────────────

/// `start` accepts `id` and `name` as aliases for `command`.
#[test]
fn start_accepts_command_aliases() {
    for raw in [
        r#"{"type":"start","command":"codex"}"#,
        r#"{"type":"start","id":"codex"}"#,
        r#"{"type":"start","name":"codex"}"#,
    ] {
        match ClientMessage::parse(raw).expect("valid start") {
            ClientMessage::Start(request) => assert_eq!(request.command, "codex"),
            other => panic!("expected start, got {other:?}"),
        }
    }
}

/// Only string-valued env entries survive.
#[test]
fn start_env_keeps_only_strings() {
    let raw = json!({
        "type": "start",
        "command": "claude",
        "env": { "A": "1", "B": 2, "C": null, "D": "x" },
        "rows": 40,
        "cols": 100,
    })
    .to_string();
    let ClientMessage::Start(request) = ClientMessage::parse(&raw).expect("valid") else {
        panic!("expected start");
    };
    let env = request.string_env();
    assert_eq!(env.len(), 2);
    assert_eq!(env["A"], "1");
    assert_eq!(env["D"], "x");
    assert_eq!(request.rows, Some(40));
    assert_eq!(request.cols, Some(100));
}

/// `input` reads `appendNewline` and both payload forms.
#[test]
fn input_fields_parse() {
    let parsed =
        ClientMessage::parse(r#"{"type":"input","data":"ls","appendNewline":true}"#).expect("ok");
    assert_eq!(
        parsed,
        ClientMessage::Input {
            data: Some("ls".into()),
            base64: None,
            append_newline: true,
        }
    );
}

/// Non-JSON, type-less and unknown-typed payloads map to distinct codes.
#[test]
fn malformed_messages_map_to_codes() {
    assert_eq!(ClientMessage::parse("not json"), Err(MessageError::InvalidJson));
    assert_eq!(
        ClientMessage::parse(r#"{"data":"x"}"#),
        Err(MessageError::InvalidMessage)
    );
    assert_eq!(
        ClientMessage::parse(r#"{"type":42}"#),
        Err(MessageError::InvalidMessage)
    );
    assert_eq!(
        ClientMessage::parse(r#"{"type":"launch"}"#),
        Err(MessageError::Unknown("launch".into()))
    );

    assert_eq!(MessageError::InvalidJson.code(), "invalid_json");
    assert_eq!(MessageError::InvalidMessage.code(), "invalid_message");
    assert_eq!(
        MessageError::Unknown("launch".into()).code(),
        "unknown_message:launch"
    );
}

/// A known type with fields of the wrong shape is `invalid_message`.
#[test]
fn known_type_with_bad_fields_is_invalid() {
    assert_eq!(
        ClientMessage::parse(r#"{"type":"resize","rows":"tall"}"#),
        Err(MessageError::InvalidMessage)
    );
    assert_eq!(
        ClientMessage::parse(r#"{"type":"start"}"#),
        Err(MessageError::InvalidMessage)
    );
}

/// `configOverrides` accepts a delimited string or a list.
#[test]
fn string_or_list_entries() {
    let one = StringOrList::One("a=1; b=2,c=3\n\n".into());
    assert_eq!(one.entries(), vec!["a=1", "b=2", "c=3"]);

    let many = StringOrList::Many(vec![" x=1 ".into(), String::new()]);
    assert_eq!(many.entries(), vec!["x=1"]);
}

// ── Serialization ───────────────────────────────────────────────────────────

/// Events are tagged by `type` with camelCase fields.
#[test]
fn server_events_serialize_camel_case() {
    let starting = ServerEvent::Starting {
        session_id: "s1".into(),
        command: "codex".into(),
        args: vec!["-c".into(), "x=1".into()],
    };
    assert_eq!(
        serde_json::to_value(&starting).expect("serialize"),
        json!({"type":"starting","sessionId":"s1","command":"codex","args":["-c","x=1"]})
    );

    let exit = ServerEvent::Exit {
        exit_code: Some(0),
        signal: None,
    };
    assert_eq!(
        serde_json::to_value(&exit).expect("serialize"),
        json!({"type":"exit","exitCode":0,"signal":null})
    );

    assert_eq!(
        serde_json::to_value(ServerEvent::error("unsupported_command")).expect("serialize"),
        json!({"type":"error","message":"unsupported_command"})
    );
}
