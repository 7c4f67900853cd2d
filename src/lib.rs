#![forbid(unsafe_code)]

//! `agent-console`: browser terminals for agent CLIs plus a supervised
//! batch task engine with crash-safe snapshots.

pub mod config;
pub mod errors;
pub mod http;
pub mod logbuf;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod pty;
pub mod state;
pub mod text;
pub mod ws;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
