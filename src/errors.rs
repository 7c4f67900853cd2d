//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// WebSocket wire-protocol violation (handshake or framing).
    Protocol(String),
    /// PTY helper process or line-protocol failure.
    Bridge(String),
    /// Task submission or supervision failure.
    Task(String),
    /// Snapshot read or write failure.
    Persistence(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Request was understood but refused (allow-list, state conflict).
    Rejected(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Bridge(msg) => write!(f, "bridge: {msg}"),
            Self::Task(msg) => write!(f, "task: {msg}"),
            Self::Persistence(msg) => write!(f, "persistence: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
