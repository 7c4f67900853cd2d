//! Versioned on-disk snapshot of the task table.
//!
//! The snapshot is a lossy projection of live tasks: logs keep their last
//! [`SNAPSHOT_LOG_LINES`] entries and stdout/stderr keep a
//! [`SNAPSHOT_TAIL_CHARS`] tail. Records that fail to parse are skipped
//! individually so one bad entry never discards the whole file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::deserialize_task_id;
use crate::models::task::{Priority, Task, TaskKind, TaskStatus, SYNTHETIC_EXIT_CODE};
use crate::text::tail_chars;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Log entries kept per task.
pub const SNAPSHOT_LOG_LINES: usize = 200;

/// Characters of stdout/stderr kept per task.
pub const SNAPSHOT_TAIL_CHARS: usize = 64 * 1024;

/// Note attached to tasks whose process died with the previous server.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by server restart";

/// Whole snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    /// Format version.
    #[serde(default)]
    pub version: u32,
    /// Write time.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Next id the engine would hand out.
    #[serde(default)]
    pub next_task_id: u64,
    /// Projected tasks.
    #[serde(default, deserialize_with = "lenient_tasks")]
    pub tasks: Vec<PersistedTask>,
}

fn lenient_tasks<'de, D>(deserializer: D) -> Result<Vec<PersistedTask>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match serde_json::from_value(record) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(index, %err, "skipping unreadable persisted task");
                None
            }
        })
        .collect())
}

/// One task as stored on disk. Everything but `id` is optional on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedTask {
    /// Task id; numeric ids from older files are accepted.
    #[serde(deserialize_with = "deserialize_task_id")]
    pub id: String,
    /// Status at save time.
    pub status: Option<String>,
    /// Prompt.
    pub prompt: Option<String>,
    /// Display command.
    pub command: Option<String>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code.
    pub exit_code: Option<i32>,
    /// URLs seen.
    pub urls: Vec<String>,
    /// Paths seen.
    pub files: Vec<String>,
    /// Last output time.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Run time.
    pub duration_ms: Option<i64>,
    /// Provider label.
    pub provider: Option<String>,
    /// Model label.
    pub model: Option<String>,
    /// Runner kind.
    #[serde(rename = "type")]
    pub kind: Option<TaskKind>,
    /// Importance hint.
    pub importance: Option<String>,
    /// Urgency hint.
    pub urgency: Option<String>,
    /// Result text.
    pub result_text: Option<String>,
    /// Result metadata.
    pub result_meta: Option<Value>,
    /// Last log entries.
    pub logs: Vec<String>,
    /// Stdout tail.
    pub stdout: String,
    /// Stderr tail.
    pub stderr: String,
    /// Total stdout bytes.
    pub stdout_bytes: u64,
    /// Total stderr bytes.
    pub stderr_bytes: u64,
    /// Manual done flag.
    pub manual_done: bool,
}

impl PersistedTask {
    /// Project a live task.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        let skip = task.logs.len().saturating_sub(SNAPSHOT_LOG_LINES);
        Self {
            id: task.id.clone(),
            status: Some(task.status.as_str().to_owned()),
            prompt: Some(task.prompt.clone()),
            command: Some(task.command.clone()),
            created_at: Some(task.created_at),
            updated_at: Some(task.updated_at),
            ended_at: task.ended_at,
            exit_code: task.exit_code,
            urls: task.urls.clone(),
            files: task.files.clone(),
            last_activity_at: Some(task.last_activity_at),
            duration_ms: task.duration_ms,
            provider: task.provider.clone(),
            model: task.model.clone(),
            kind: task.kind.clone(),
            importance: Some(priority_name(task.importance).to_owned()),
            urgency: Some(priority_name(task.urgency).to_owned()),
            result_text: task.result_text.clone(),
            result_meta: task.result_meta.clone(),
            logs: task.logs[skip..].to_vec(),
            stdout: tail_chars(&task.stdout, SNAPSHOT_TAIL_CHARS).to_owned(),
            stderr: tail_chars(&task.stderr, SNAPSHOT_TAIL_CHARS).to_owned(),
            stdout_bytes: task.stdout_bytes,
            stderr_bytes: task.stderr_bytes,
            manual_done: task.manual_done,
        }
    }

    /// Rebuild a live task, forcing non-terminal work to `failed`.
    ///
    /// `pending` and `running` tasks lost their process with the previous
    /// server; `external` tasks keep their status.
    #[must_use]
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let status = self
            .status
            .as_deref()
            .and_then(parse_status)
            .unwrap_or(TaskStatus::Completed);
        let created_at = self.created_at.unwrap_or(now);
        let updated_at = self.updated_at.unwrap_or(created_at);

        let mut task = Task {
            id: self.id,
            status,
            prompt: self.prompt.unwrap_or_default(),
            command: self.command.unwrap_or_default(),
            pid: None,
            created_at,
            updated_at,
            ended_at: self.ended_at,
            last_activity_at: self.last_activity_at.unwrap_or(updated_at),
            exit_code: self.exit_code,
            duration_ms: self.duration_ms,
            logs: self.logs,
            urls: self.urls,
            files: self.files,
            stdout: self.stdout,
            stderr: self.stderr,
            stdout_bytes: self.stdout_bytes,
            stderr_bytes: self.stderr_bytes,
            result_text: self.result_text,
            result_meta: self.result_meta,
            provider: self.provider,
            model: self.model,
            kind: self.kind,
            importance: Priority::normalize(self.importance.as_deref()),
            urgency: Priority::normalize(self.urgency.as_deref()),
            manual_done: self.manual_done,
        };

        if matches!(status, TaskStatus::Pending | TaskStatus::Running) {
            interrupt(&mut task, now);
        }
        task
    }
}

fn interrupt(task: &mut Task, now: DateTime<Utc>) {
    task.status = TaskStatus::Failed;
    task.result_text = Some(match task.result_text.take() {
        Some(text) if !text.is_empty() => format!("{text}\n{INTERRUPTED_MESSAGE}"),
        _ => INTERRUPTED_MESSAGE.to_owned(),
    });
    task.logs.push(INTERRUPTED_MESSAGE.to_owned());
    task.exit_code = Some(task.exit_code.unwrap_or(SYNTHETIC_EXIT_CODE));
    let ended_at = *task.ended_at.get_or_insert(now);
    task.updated_at = ended_at;
    if task.duration_ms.is_none() {
        task.duration_ms = Some((ended_at - task.created_at).num_milliseconds());
    }
}

fn parse_status(raw: &str) -> Option<TaskStatus> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase())).ok()
}

fn priority_name(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
    }
}

impl PersistedSnapshot {
    /// Build a snapshot of `tasks`.
    pub fn capture<'a>(
        next_task_id: u64,
        tasks: impl IntoIterator<Item = &'a Task>,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Some(saved_at),
            next_task_id,
            tasks: tasks.into_iter().map(PersistedTask::from_task).collect(),
        }
    }

    /// Rehydrate every task and compute the restored id counter:
    /// `max(first_task_id, nextTaskId, 1 + highest numeric id)`.
    #[must_use]
    pub fn restore(self, first_task_id: u64, now: DateTime<Utc>) -> (Vec<Task>, u64) {
        let highest = self
            .tasks
            .iter()
            .filter_map(|task| task.id.parse::<u64>().ok())
            .max();
        let next_id = first_task_id
            .max(self.next_task_id)
            .max(highest.map_or(0, |id| id.saturating_add(1)));

        let tasks = self
            .tasks
            .into_iter()
            .filter(|task| !task.id.is_empty())
            .map(|task| task.into_task(now))
            .collect();
        (tasks, next_id)
    }
}
