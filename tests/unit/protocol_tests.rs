//! Unit tests for the helper line protocol and its codec.

use bytes::BytesMut;
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

use agent_console::pty::codec::{Decoded, HelperCodec, ServerCodec, MAX_LINE_BYTES};
use agent_console::pty::protocol::{
    parse_helper_line, ControlMessage, HelperLine, HelperMessage,
};
use agent_console::AppError;

fn decode_all(codec: &mut ServerCodec, buf: &mut BytesMut) -> Vec<HelperMessage> {
    let mut out = Vec::new();
    while let Some(decoded) = codec.decode(buf).expect("decode") {
        match decoded {
            Decoded::Message(HelperLine::Message(message)) => out.push(message),
            other => panic!("unexpected line {other:?}"),
        }
    }
    out
}

fn encode_line(message: ControlMessage) -> serde_json::Value {
    let mut codec = ServerCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(message, &mut buf).expect("encode");
    assert!(buf.ends_with(b"\n"));
    serde_json::from_slice(&buf[..buf.len() - 1]).expect("json line")
}

// ── Line buffering ──────────────────────────────────────────────────────────

/// A line split across two reads is held until its newline arrives.
#[test]
fn split_line_is_buffered_until_newline() {
    let mut codec = ServerCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"ready\"}\n\n{\"typ");

    let first = decode_all(&mut codec, &mut buf);
    assert_eq!(first, vec![HelperMessage::Ready { pid: None }]);

    buf.extend_from_slice(b"e\":\"pong\"}\n");
    let second = decode_all(&mut codec, &mut buf);
    assert_eq!(second, vec![HelperMessage::Pong { ts: None }]);
}

/// An overlong line is reported once, skipped up to its newline, and the
/// next line decodes normally.
#[test]
fn overlong_line_is_skipped_and_stream_resumes() {
    let mut codec = ServerCodec::new();
    let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_BYTES + 1].as_slice());
    let first = codec.decode(&mut buf).expect("decode").expect("reported");
    assert!(
        matches!(first, Decoded::Invalid { ref reason, .. } if reason.contains("too long")),
        "got {first:?}"
    );
    assert!(buf.is_empty());

    buf.extend_from_slice(b"aaaa\n{\"type\":\"ready\",\"pid\":4}\n");
    assert_eq!(decode_all(&mut codec, &mut buf), vec![HelperMessage::Ready { pid: Some(4) }]);
}

/// A malformed line becomes an invalid item and later lines still decode.
#[test]
fn malformed_line_does_not_stop_decoding() {
    let mut codec = ServerCodec::new();
    let mut buf = BytesMut::from("{not json\n{\"type\":\"pong\"}\n");

    let bad = codec.decode(&mut buf).expect("decode").expect("item");
    match bad {
        Decoded::Invalid { reason, preview } => {
            assert!(reason.contains("failed to parse helper message"), "{reason}");
            assert_eq!(preview, "{not json");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(decode_all(&mut codec, &mut buf), vec![HelperMessage::Pong { ts: None }]);
}

/// A final line without a newline is decoded at end of stream.
#[test]
fn trailing_line_is_decoded_at_eof() {
    let mut codec = HelperCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"terminate\",\"signal\":\"SIGINT\"}");
    assert!(codec.decode(&mut buf).expect("decode").is_none());

    let last = codec.decode_eof(&mut buf).expect("decode").expect("item");
    assert_eq!(
        last,
        Decoded::Message(ControlMessage::Terminate {
            signal: Some("SIGINT".into()),
        })
    );
    assert!(codec.decode_eof(&mut buf).expect("decode").is_none());
}

/// Control messages encode as one JSON object per line.
#[test]
fn control_messages_encode_as_lines() {
    let value = encode_line(ControlMessage::Resize {
        rows: Some(40),
        cols: None,
    });
    assert_eq!(value, json!({"type":"resize","rows":40,"cols":null}));
}

/// The helper side writes its own messages in the same framing.
#[test]
fn helper_messages_encode_as_lines() {
    let mut codec = HelperCodec::new();
    let mut buf = BytesMut::new();
    codec
        .encode(
            HelperMessage::Exit {
                exit_code: None,
                signal: Some(json!("SIGTERM")),
            },
            &mut buf,
        )
        .expect("encode");
    assert_eq!(&buf[..], b"{\"type\":\"exit\",\"exitCode\":null,\"signal\":\"SIGTERM\"}\n");
}

// ── Message parsing ─────────────────────────────────────────────────────────

/// Known helper messages parse to their variants.
#[test]
fn known_helper_messages_parse() {
    let exit = parse_helper_line(r#"{"type":"exit","exitCode":3,"signal":null}"#)
        .expect("ok")
        .expect("line");
    assert_eq!(
        exit,
        HelperLine::Message(HelperMessage::Exit {
            exit_code: Some(3),
            signal: None,
        })
    );

    let error = parse_helper_line(r#"{"type":"error","message":"boom","code":"spawn_failed"}"#)
        .expect("ok")
        .expect("line");
    assert_eq!(
        error,
        HelperLine::Message(HelperMessage::Error {
            message: "boom".into(),
            code: Some("spawn_failed".into()),
        })
    );
}

/// Unknown object types become generic debug lines.
#[test]
fn unknown_helper_type_is_forwarded() {
    let line = parse_helper_line(r#"{"type":"trace","detail":1}"#)
        .expect("ok")
        .expect("line");
    assert_eq!(line, HelperLine::Other(json!({"type":"trace","detail":1})));
}

/// Blank lines are skipped; malformed ones are recoverable errors.
#[test]
fn blank_and_malformed_lines() {
    assert_eq!(parse_helper_line("   ").expect("ok"), None);
    assert!(matches!(
        parse_helper_line("{not json"),
        Err(AppError::Bridge(_))
    ));
    assert!(matches!(
        parse_helper_line(r#"{"type":"output"}"#),
        Err(AppError::Bridge(_))
    ));
}

/// Input from the server is always base64-tagged.
#[test]
fn input_control_message_shape() {
    let value = encode_line(ControlMessage::Input {
        encoding: Some("base64".into()),
        data: "aGk=".into(),
    });
    assert_eq!(value, json!({"type":"input","encoding":"base64","data":"aGk="}));
}
