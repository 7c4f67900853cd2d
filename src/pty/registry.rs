//! Registry of live interactive sessions.
//!
//! Each connection owns its [`ProcessBridge`](crate::pty::bridge::ProcessBridge)
//! directly; the registry only indexes them so collaborators can list and
//! stop sessions. Entries are removed by dropping the [`SessionGuard`]
//! returned from [`SessionRegistry::attach`], which keeps teardown tied to
//! the owning connection's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{AppError, Result};

/// Public view of one session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Resolved program.
    pub command: String,
    /// Resolved arguments.
    pub args: Vec<String>,
    /// Child pid once ready.
    pub pid: Option<u32>,
    /// Owning connection.
    pub connection_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Helper reported `ready`.
    pub ready: bool,
}

#[derive(Debug)]
struct Entry {
    summary: SessionSummary,
    stop: CancellationToken,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Shared session index.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    entries: Entries,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for its connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rejected` if the connection already has a session.
    pub fn attach(&self, summary: SessionSummary) -> Result<SessionGuard> {
        let mut entries = self.lock();
        if entries
            .values()
            .any(|entry| entry.summary.connection_id == summary.connection_id)
        {
            return Err(AppError::Rejected("session_already_started".into()));
        }

        let stop = CancellationToken::new();
        let id = summary.id.clone();
        info!(session_id = %id, connection_id = %summary.connection_id, "session registered");
        entries.insert(
            id.clone(),
            Entry {
                summary,
                stop: stop.clone(),
            },
        );

        Ok(SessionGuard {
            id,
            stop,
            entries: Arc::clone(&self.entries),
        })
    }

    /// Record readiness and the child pid.
    pub fn mark_ready(&self, session_id: &str, pid: Option<u32>) {
        if let Some(entry) = self.lock().get_mut(session_id) {
            entry.summary.ready = true;
            entry.summary.pid = pid.or(entry.summary.pid);
        }
    }

    /// Ask the owning connection to dispose of a session.
    ///
    /// Returns `false` when no such session exists.
    #[must_use]
    pub fn stop(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(entry) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of live sessions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .lock()
            .values()
            .map(|entry| entry.summary.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its session from the registry on drop.
#[derive(Debug)]
pub struct SessionGuard {
    id: String,
    stop: CancellationToken,
    entries: Entries,
}

impl SessionGuard {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when a collaborator asks for this session to stop.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        debug!(session_id = %self.id, "session unregistered");
    }
}
