//! Bridge event → client event translation.
//!
//! Kept free of I/O so the mapping and the terminal shim can be tested
//! without a socket or a helper.

use serde_json::Value;

use crate::pty::bridge::BridgeEvent;
use crate::ws::messages::ServerEvent;

/// Cursor position query (`ESC [ 6 n`).
pub const CURSOR_POSITION_QUERY: &[u8] = b"\x1b[6n";

/// Canned reply reporting row 1, column 1.
pub const CURSOR_POSITION_REPLY: &[u8] = b"\x1b[1;1R";

/// Identity fields copied into `ready` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Session id.
    pub session_id: String,
    /// Resolved program.
    pub command: String,
    /// Resolved arguments.
    pub args: Vec<String>,
}

/// What the connection should do for one bridge event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Relay {
    /// Event to send to the client.
    pub event: Option<ServerEvent>,
    /// Bytes to write back into the session.
    pub reply: Option<&'static [u8]>,
    /// Close the connection with 1000 after sending.
    pub close: bool,
}

/// Map a bridge event to outbound actions.
#[must_use]
pub fn relay_event(identity: &SessionIdentity, event: BridgeEvent) -> Relay {
    match event {
        BridgeEvent::Ready { pid } => Relay {
            event: Some(ServerEvent::Ready {
                session_id: identity.session_id.clone(),
                command: identity.command.clone(),
                args: identity.args.clone(),
                pid,
            }),
            ..Relay::default()
        },
        BridgeEvent::Output { data, bytes } => Relay {
            event: Some(ServerEvent::Output { data }),
            reply: contains_cursor_query(&bytes).then_some(CURSOR_POSITION_REPLY),
            close: false,
        },
        BridgeEvent::Exit { exit_code, signal } => Relay {
            event: Some(ServerEvent::Exit { exit_code, signal }),
            reply: None,
            close: true,
        },
        BridgeEvent::Error { message } => Relay {
            event: Some(ServerEvent::error(message)),
            ..Relay::default()
        },
        BridgeEvent::Pong { ts } => Relay {
            event: Some(ServerEvent::Pong {
                ts: ts.unwrap_or(Value::Null),
            }),
            ..Relay::default()
        },
        BridgeEvent::Debug(_) | BridgeEvent::Stderr(_) => Relay::default(),
    }
}

/// The output chunk asks the terminal for its cursor position.
#[must_use]
pub fn contains_cursor_query(bytes: &[u8]) -> bool {
    bytes
        .windows(CURSOR_POSITION_QUERY.len())
        .any(|window| window == CURSOR_POSITION_QUERY)
}
