//! Helper process line protocol.
//!
//! Both directions carry one JSON object per line, tagged by `type`.
//! [`HelperMessage`] flows helper → server, [`ControlMessage`] flows
//! server → helper. The helper binary and the server share these types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Helper → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HelperMessage {
    /// The command is running inside the PTY.
    Ready {
        /// Child process id.
        #[serde(default)]
        pid: Option<u32>,
    },
    /// Raw terminal output.
    Output {
        /// Base64-encoded bytes.
        data: String,
    },
    /// The child exited.
    #[serde(rename_all = "camelCase")]
    Exit {
        /// Exit code, absent when killed by a signal.
        #[serde(default)]
        exit_code: Option<i32>,
        /// Signal number or name.
        #[serde(default)]
        signal: Option<Value>,
    },
    /// Helper-side failure.
    Error {
        /// Human-readable description.
        message: String,
        /// Optional machine-readable code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Answer to a [`ControlMessage::Ping`].
    Pong {
        /// Echoed timestamp.
        #[serde(default)]
        ts: Option<Value>,
    },
}

/// A parsed helper line: either a known message or an unrecognised object.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperLine {
    /// One of the known [`HelperMessage`] variants.
    Message(HelperMessage),
    /// Any other JSON value, forwarded as a debug event.
    Other(Value),
}

const KNOWN_HELPER_TYPES: &[&str] = &["ready", "output", "exit", "error", "pong"];

/// Parse one line from the helper's stdout.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns `AppError::Bridge` when the line is not JSON or a known message
/// type is missing required fields. Callers treat this as recoverable.
pub fn parse_helper_line(line: &str) -> Result<Option<HelperLine>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Bridge(format!("failed to parse helper message: {e}")))?;

    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind {
        Some(kind) if KNOWN_HELPER_TYPES.contains(&kind.as_str()) => {
            serde_json::from_value(value)
                .map(|message| Some(HelperLine::Message(message)))
                .map_err(|e| AppError::Bridge(format!("invalid {kind} message: {e}")))
        }
        _ => Ok(Some(HelperLine::Other(value))),
    }
}

/// Server → helper message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Bytes for the PTY.
    Input {
        /// `"base64"` when `data` is base64, anything else means UTF-8.
        #[serde(default)]
        encoding: Option<String>,
        /// Payload.
        data: String,
    },
    /// Resize the PTY.
    Resize {
        /// Rows.
        #[serde(default)]
        rows: Option<u16>,
        /// Columns.
        #[serde(default)]
        cols: Option<u16>,
    },
    /// Deliver a named signal to the child.
    Terminate {
        /// Signal name such as `SIGTERM`.
        #[serde(default)]
        signal: Option<String>,
    },
    /// Liveness probe.
    Ping {
        /// Opaque timestamp.
        #[serde(default)]
        ts: Option<Value>,
    },
}
