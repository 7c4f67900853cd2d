//! WebSocket endpoint: handshake, framing and per-connection dispatch.

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod messages;
