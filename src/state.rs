//! Shared application state handed to every connection and HTTP handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::logbuf::LogBuffer;
use crate::orchestrator::TaskEngine;
use crate::pty::registry::SessionRegistry;
use crate::GlobalConfig;

/// Owning context for the long-lived registries.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<GlobalConfig>,
    /// Batch task engine.
    pub tasks: Arc<TaskEngine>,
    /// Live interactive sessions.
    pub sessions: SessionRegistry,
    /// In-memory server log tail.
    pub logs: LogBuffer,
    /// Server start time.
    pub started_at: DateTime<Utc>,
    /// Port the listener is bound to.
    pub port: u16,
}

impl AppState {
    /// Assemble state around an existing task engine.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, tasks: Arc<TaskEngine>, logs: LogBuffer) -> Self {
        Self {
            tasks,
            sessions: SessionRegistry::new(),
            logs,
            started_at: Utc::now(),
            port: config.server.port,
            config,
        }
    }

    /// Record the port actually bound (differs from config for port 0).
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}
