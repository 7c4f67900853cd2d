//! JSON control messages exchanged over text frames.
//!
//! Inbound messages are validated once at the boundary into
//! [`ClientMessage`]; anything malformed maps to a [`MessageError`] whose
//! [`code`](MessageError::code) is sent back to the client verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single string or a list of strings.
///
/// Clients send `configOverrides` either way.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StringOrList {
    /// Delimited list in one string (`;`, `,` or newline).
    One(String),
    /// Explicit list.
    Many(Vec<String>),
}

impl StringOrList {
    /// Flatten into trimmed, non-empty entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        match self {
            Self::One(raw) => raw
                .split([';', ',', '\n'])
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect(),
            Self::Many(list) => list
                .iter()
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// Payload of a `start` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Command identifier, checked against the allow-list.
    #[serde(alias = "id", alias = "name")]
    pub command: String,
    /// Extra arguments appended after the command defaults.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment; only string values are honoured.
    #[serde(default)]
    pub env: BTreeMap<String, serde_json::Value>,
    /// Initial terminal rows.
    #[serde(default)]
    pub rows: Option<u16>,
    /// Initial terminal columns.
    #[serde(default)]
    pub cols: Option<u16>,
    /// Subcommand placed before the remaining arguments.
    #[serde(default)]
    pub subcommand: Option<String>,
    /// Claude: per-session MCP config path.
    #[serde(default)]
    pub mcp_config_path: Option<String>,
    /// Codex: `-c` overrides.
    #[serde(default)]
    pub config_overrides: Option<StringOrList>,
}

impl StartRequest {
    /// String-valued environment entries.
    #[must_use]
    pub fn string_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_owned())))
            .collect()
    }
}

/// Closed set of client → server control messages.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Spawn a session for this connection.
    Start(StartRequest),
    /// Forward bytes to the session.
    Input {
        /// UTF-8 text input.
        #[serde(default)]
        data: Option<String>,
        /// Base64 input; wins over `data`.
        #[serde(default)]
        base64: Option<String>,
        /// Append a carriage return after the payload.
        #[serde(default, rename = "appendNewline")]
        append_newline: bool,
    },
    /// Resize the terminal.
    Resize {
        /// New row count.
        #[serde(default)]
        rows: Option<u16>,
        /// New column count.
        #[serde(default)]
        cols: Option<u16>,
    },
    /// Ask the session to terminate with a named signal.
    Terminate {
        /// Signal name, `SIGTERM` when absent.
        #[serde(default)]
        signal: Option<String>,
    },
    /// Liveness probe answered with `pong`.
    Ping {
        /// Opaque timestamp echoed back.
        #[serde(default)]
        ts: Option<serde_json::Value>,
    },
    /// Close the connection and tear down the session.
    Close,
}

/// Reasons an inbound text frame could not become a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Payload is not JSON.
    InvalidJson,
    /// JSON but not an object with a string `type`, or known type with bad fields.
    InvalidMessage,
    /// Well-formed object with an unrecognised `type`.
    Unknown(String),
}

impl MessageError {
    /// Wire code sent in the `error` event.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::InvalidJson => "invalid_json".into(),
            Self::InvalidMessage => "invalid_message".into(),
            Self::Unknown(kind) => format!("unknown_message:{kind}"),
        }
    }
}

const KNOWN_TYPES: &[&str] = &["start", "input", "resize", "terminate", "ping", "close"];

impl ClientMessage {
    /// Parse and validate one text-frame payload.
    ///
    /// # Errors
    ///
    /// Returns the [`MessageError`] describing why the payload was refused.
    pub fn parse(text: &str) -> std::result::Result<Self, MessageError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| MessageError::InvalidJson)?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(MessageError::InvalidMessage)?;

        if !KNOWN_TYPES.contains(&kind) {
            return Err(MessageError::Unknown(kind.to_owned()));
        }

        serde_json::from_value(value).map_err(|_| MessageError::InvalidMessage)
    }
}

/// Server → client events.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Session spawned; the helper has not reported readiness yet.
    #[serde(rename_all = "camelCase")]
    Starting {
        /// Session identifier.
        session_id: String,
        /// Resolved program.
        command: String,
        /// Resolved arguments.
        args: Vec<String>,
    },
    /// Helper reported readiness.
    #[serde(rename_all = "camelCase")]
    Ready {
        /// Session identifier.
        session_id: String,
        /// Resolved program.
        command: String,
        /// Resolved arguments.
        args: Vec<String>,
        /// Process id inside the PTY.
        pid: Option<u32>,
    },
    /// Terminal output, base64-encoded.
    Output {
        /// Base64 payload.
        data: String,
    },
    /// Message-level or session-level error.
    Error {
        /// Error code or description.
        message: String,
    },
    /// Session process exited.
    #[serde(rename_all = "camelCase")]
    Exit {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<serde_json::Value>,
    },
    /// Answer to a `ping`.
    Pong {
        /// Echoed timestamp.
        ts: serde_json::Value,
    },
}

impl ServerEvent {
    /// Convenience constructor for [`ServerEvent::Error`].
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
