//! Task model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::artifacts;

/// Characters of stdout/stderr kept on a live task.
pub const LIVE_TAIL_CHARS: usize = 4 * 1024 * 1024;

/// Exit code recorded when a task never produced a real one.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, process not yet spawned.
    Pending,
    /// Process running.
    Running,
    /// Exited with code 0.
    Completed,
    /// Non-zero exit, spawn failure or interrupted by restart.
    Failed,
    /// Executed by a collaborator outside this process.
    External,
}

impl TaskStatus {
    /// `completed` and `failed` never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::External => "external",
        }
    }
}

/// Priority hint used by dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Low.
    Low,
    /// Medium (default).
    #[default]
    Medium,
    /// High.
    High,
}

impl Priority {
    /// Parse a loosely-typed hint; anything unrecognised is `medium`.
    #[must_use]
    pub fn normalize(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Which runner produced the task.
///
/// Stored as a plain string. Names this server does not produce are kept
/// as [`TaskKind::Other`] and written back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    /// Claude headless CLI.
    ClaudeCli,
    /// Synchronous Claude chat run.
    ClaudeChat,
    /// `codex exec --json`.
    CodexExec,
    /// Delegated to an external executor.
    External,
    /// Any other runner name.
    Other(String),
}

impl TaskKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClaudeCli => "claude_cli",
            Self::ClaudeChat => "claude_chat",
            Self::CodexExec => "codex_exec",
            Self::External => "external",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for TaskKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "claude_cli" => Self::ClaudeCli,
            "claude_chat" => Self::ClaudeChat,
            "codex_exec" => Self::CodexExec,
            "external" => Self::External,
            _ => Self::Other(name),
        }
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

/// Which captured stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Task domain entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Decimal id, unique per server.
    pub id: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Prompt text.
    pub prompt: String,
    /// Display form of the spawned command line.
    pub command: String,
    /// Process id while running.
    pub pid: Option<u32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Last output time.
    pub last_activity_at: DateTime<Utc>,
    /// Process exit code, `-1` for synthetic failures.
    pub exit_code: Option<i32>,
    /// `ended_at - created_at`.
    pub duration_ms: Option<i64>,
    /// Output chunks and derived log lines.
    pub logs: Vec<String>,
    /// URLs seen in output, first-seen order.
    pub urls: Vec<String>,
    /// Absolute paths seen in output, first-seen order.
    pub files: Vec<String>,
    /// Bounded stdout tail.
    pub stdout: String,
    /// Bounded stderr tail.
    pub stderr: String,
    /// Total stdout bytes.
    pub stdout_bytes: u64,
    /// Total stderr bytes.
    pub stderr_bytes: u64,
    /// Assistant-visible result.
    pub result_text: Option<String>,
    /// Structured result metadata.
    pub result_meta: Option<Value>,
    /// Provider label.
    pub provider: Option<String>,
    /// Model label.
    pub model: Option<String>,
    /// Runner kind.
    #[serde(rename = "type")]
    pub kind: Option<TaskKind>,
    /// Importance hint.
    pub importance: Priority,
    /// Urgency hint.
    pub urgency: Priority,
    /// Operator marked the task done.
    pub manual_done: bool,
}

impl Task {
    /// New `pending` task.
    #[must_use]
    pub fn new(id: String, prompt: String, command: String, kind: TaskKind, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            prompt,
            command,
            pid: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
            last_activity_at: now,
            exit_code: None,
            duration_ms: None,
            logs: Vec::new(),
            urls: Vec::new(),
            files: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            stdout_bytes: 0,
            stderr_bytes: 0,
            result_text: None,
            result_meta: None,
            provider: None,
            model: None,
            kind: Some(kind),
            importance: Priority::Medium,
            urgency: Priority::Medium,
            manual_done: false,
        }
    }

    /// `pending → running`. Returns `false` from any other status.
    pub fn mark_running(&mut self, pid: Option<u32>, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.pid = pid;
        self.updated_at = now;
        true
    }

    /// Record the OS pid of a running task. Returns `false` unless running.
    pub fn attach_pid(&mut self, pid: Option<u32>, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.pid = pid;
        self.updated_at = now;
        true
    }

    /// `pending → external`. Returns `false` from any other status.
    pub fn mark_external(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::External;
        self.updated_at = now;
        true
    }

    /// Append raw captured bytes to the matching tail and counter, and bump
    /// activity.
    pub fn record_stream(
        &mut self,
        stream: OutputStream,
        text: &str,
        byte_len: usize,
        now: DateTime<Utc>,
    ) {
        let (buffer, counter) = match stream {
            OutputStream::Stdout => (&mut self.stdout, &mut self.stdout_bytes),
            OutputStream::Stderr => (&mut self.stderr, &mut self.stderr_bytes),
        };
        crate::text::push_bounded_tail(buffer, text, LIVE_TAIL_CHARS);
        *counter = counter.saturating_add(u64::try_from(byte_len).unwrap_or(u64::MAX));
        if byte_len > 0 {
            self.updated_at = now;
            self.last_activity_at = now;
        }
    }

    /// Append a log entry, collect artifacts from it and bump activity.
    pub fn push_log(&mut self, text: &str, now: DateTime<Utc>) {
        if text.is_empty() {
            return;
        }
        self.logs.push(text.to_owned());
        artifacts::merge_unique(&mut self.urls, artifacts::extract_urls(text));
        artifacts::merge_unique(&mut self.files, artifacts::extract_paths(text));
        self.updated_at = now;
        self.last_activity_at = now;
    }

    /// Record the exit code and move to `completed` (0) or `failed`.
    ///
    /// Returns `false` without touching anything if already terminal.
    pub fn finish(&mut self, exit_code: Option<i32>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if exit_code == Some(0) {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.close(exit_code, now);
        true
    }

    /// Move to `failed` with exit code `-1` and log `message`.
    ///
    /// Returns `false` without touching anything if already terminal.
    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.push_log(message, now);
        self.status = TaskStatus::Failed;
        self.close(Some(SYNTHETIC_EXIT_CODE), now);
        true
    }

    /// Toggle the manual done flag. Completed tasks refuse.
    pub fn set_manual_done(&mut self, done: bool, now: DateTime<Utc>) -> bool {
        if self.status == TaskStatus::Completed {
            return false;
        }
        self.manual_done = done;
        self.updated_at = now;
        true
    }

    /// Milliseconds since the last output.
    #[must_use]
    pub fn idle_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity_at).num_milliseconds().max(0)
    }

    fn close(&mut self, exit_code: Option<i32>, now: DateTime<Utc>) {
        self.exit_code = exit_code;
        self.ended_at = Some(now);
        self.updated_at = now;
        self.pid = None;
        self.duration_ms = Some((now - self.created_at).num_milliseconds());
    }
}

/// Counts per status.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskStats {
    /// All tasks.
    pub total: usize,
    /// Pending.
    pub pending: usize,
    /// Running.
    pub running: usize,
    /// Completed.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// External.
    pub external: usize,
}

impl TaskStats {
    /// Tally a set of tasks.
    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::External => stats.external += 1,
            }
        }
        stats
    }
}
