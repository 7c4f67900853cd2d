//! Task routes under `/api/agent` and `/api/codex`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::{parse_body, ApiError};
use crate::models::task::{Priority, Task, TaskKind, TaskStatus};
use crate::orchestrator::request::{truthy, ClaudeTaskRequest, CodexTaskRequest};
use crate::state::AppState;
use crate::text::tail_chars;
use crate::AppError;

/// Characters of logs/stdout/stderr included in a detailed view.
pub const VIEW_TAIL_CHARS: usize = 20_000;

/// Log entries returned by `/api/codex/chat`.
const CHAT_LOG_ENTRIES: usize = 500;

const PROMPT_PREVIEW_CHARS: usize = 12;

/// Client-facing projection of a [`Task`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    /// Id.
    pub id: String,
    /// Status.
    pub status: TaskStatus,
    /// Prompt.
    pub prompt: String,
    /// First prompt line, shortened.
    pub prompt_preview: String,
    /// Display command.
    pub command: String,
    /// Pid while running.
    pub pid: Option<u32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// End time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code.
    pub exit_code: Option<i32>,
    /// URLs seen.
    pub urls: Vec<String>,
    /// Paths seen.
    pub files: Vec<String>,
    /// Last output.
    pub last_activity_at: DateTime<Utc>,
    /// Run time.
    pub duration_ms: Option<i64>,
    /// Provider.
    pub provider: Option<String>,
    /// Model.
    pub model: Option<String>,
    /// Runner kind.
    #[serde(rename = "type")]
    pub kind: Option<TaskKind>,
    /// Importance.
    pub importance: Priority,
    /// Urgency.
    pub urgency: Priority,
    /// `num_turns` from the result metadata.
    pub num_turns: Option<Value>,
    /// Result text.
    pub result_text: Option<String>,
    /// Manual done flag.
    pub manual_done: bool,
    /// Output tails, only with `logs=1`.
    #[serde(flatten)]
    pub detail: Option<TaskDetail>,
}

/// Output tails attached to a detailed [`TaskView`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    /// Logs joined by newlines, tail.
    pub logs: String,
    /// Stdout tail.
    pub stdout: String,
    /// Stderr tail.
    pub stderr: String,
    /// Result metadata.
    pub result_meta: Option<Value>,
}

impl TaskView {
    /// Project `task`; `detailed` adds output tails and `resultMeta`.
    #[must_use]
    pub fn new(task: &Task, detailed: bool) -> Self {
        let num_turns = task.result_meta.as_ref().and_then(|meta| {
            meta.get("num_turns")
                .or_else(|| meta.get("numTurns"))
                .filter(|value| !value.is_null())
                .cloned()
        });
        let detail = detailed.then(|| TaskDetail {
            logs: tail_chars(&task.logs.join("\n"), VIEW_TAIL_CHARS).to_owned(),
            stdout: tail_chars(&task.stdout, VIEW_TAIL_CHARS).to_owned(),
            stderr: tail_chars(&task.stderr, VIEW_TAIL_CHARS).to_owned(),
            result_meta: task.result_meta.clone(),
        });

        Self {
            id: task.id.clone(),
            status: task.status,
            prompt: task.prompt.clone(),
            prompt_preview: prompt_preview(&task.prompt, PROMPT_PREVIEW_CHARS),
            command: task.command.clone(),
            pid: task.pid,
            created_at: task.created_at,
            updated_at: task.updated_at,
            ended_at: task.ended_at,
            exit_code: task.exit_code,
            urls: task.urls.clone(),
            files: task.files.clone(),
            last_activity_at: task.last_activity_at,
            duration_ms: task.duration_ms,
            provider: task.provider.clone(),
            model: task.model.clone(),
            kind: task.kind.clone(),
            importance: task.importance,
            urgency: task.urgency,
            num_turns,
            result_text: task.result_text.clone(),
            manual_done: task.manual_done,
            detail,
        }
    }
}

/// First non-empty line of `prompt`, cut to `limit` characters with `…`.
#[must_use]
pub fn prompt_preview(prompt: &str, limit: usize) -> String {
    let first = prompt
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if first.chars().count() <= limit {
        return first.to_owned();
    }
    let mut preview: String = first.chars().take(limit.saturating_sub(1)).collect();
    preview.push('…');
    preview
}

/// `?id=..&logs=1`.
#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    id: Option<String>,
    logs: Option<String>,
}

fn accepted(task: &Task) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "task": TaskView::new(task, false) })),
    )
        .into_response()
}

/// `POST /api/agent/submit`.
pub async fn submit_claude(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ClaudeTaskRequest = parse_body(&body)?;
    let task = state.tasks.submit_claude(request)?;
    Ok(accepted(&task))
}

/// `POST /api/codex/submit`.
pub async fn submit_codex(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CodexTaskRequest = parse_body(&body)?;
    let task = state.tasks.submit_codex(request)?;
    Ok(accepted(&task))
}

/// `POST /api/claude/chat`: run Claude headless and wait for its reply.
pub async fn claude_chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ClaudeTaskRequest = parse_body(&body)?;
    let prompt = request.prompt.clone();
    let submitted = match state.tasks.submit_claude_chat(request) {
        Ok(task) => task,
        Err(AppError::Task(message)) => {
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response());
        }
        Err(err) => return Err(err.into()),
    };
    let task = state.tasks.wait_terminal(&submitted.id).await?;

    if task.status == TaskStatus::Failed {
        let message = task.logs.last().map_or("Claude chat failed", |line| {
            line.strip_prefix("[ERROR] ").unwrap_or(line)
        });
        warn!(task_id = %task.id, exit_code = ?task.exit_code, "claude chat failed");
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": message.trim(), "taskId": task.id })),
        )
            .into_response());
    }

    let response = task.result_text.clone().unwrap_or_default();
    let mut result = match task.result_meta.clone() {
        Some(Value::Object(meta)) => meta,
        _ => serde_json::Map::new(),
    };
    result.insert("result".into(), Value::String(response.clone()));
    let skip = task.logs.len().saturating_sub(CHAT_LOG_ENTRIES);
    Ok(Json(json!({
        "taskId": task.id,
        "prompt": prompt,
        "response": response,
        "logs": &task.logs[skip..],
        "result": result,
    }))
    .into_response())
}

/// `POST /api/codex/chat`: submit and wait for the run to finish.
pub async fn codex_chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CodexTaskRequest = parse_body(&body)?;
    let prompt = request.prompt.clone();
    let submitted = state.tasks.submit_codex(request)?;
    let task = state.tasks.wait_terminal(&submitted.id).await?;

    if task.status == TaskStatus::Failed {
        let message = task
            .result_meta
            .as_ref()
            .and_then(|meta| meta.get("errors"))
            .and_then(Value::as_array)
            .and_then(|errors| errors.last())
            .and_then(Value::as_str)
            .map_or_else(|| task.logs.last().cloned().unwrap_or_default(), str::to_owned);
        warn!(task_id = %task.id, exit_code = ?task.exit_code, "codex chat failed");
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Codex task failed",
                "message": message.trim(),
                "taskId": task.id,
            })),
        )
            .into_response());
    }

    let response = task.result_text.clone().unwrap_or_default();
    let meta = task.result_meta.clone().unwrap_or(Value::Null);
    let skip = task.logs.len().saturating_sub(CHAT_LOG_ENTRIES);
    Ok(Json(json!({
        "taskId": task.id,
        "prompt": prompt,
        "response": response,
        "logs": &task.logs[skip..],
        "result": {
            "result": response,
            "provider": "codex",
            "model": meta
                .get("model")
                .filter(|model| !model.is_null())
                .cloned()
                .or_else(|| task.model.clone().map(Value::String)),
            "token_usage": meta.get("token_usage").cloned().unwrap_or(Value::Null),
            "errors": meta.get("errors").filter(|errors| errors.is_array()).cloned(),
            "meta": meta,
        },
    }))
    .into_response())
}

/// `GET /api/agent/status[?id]`.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let persisted_at = state.tasks.persisted_at();
    if let Some(id) = query.id.filter(|id| !id.is_empty()) {
        let task = state
            .tasks
            .get(&id)
            .ok_or_else(|| AppError::NotFound("Task not found".into()))?;
        return Ok(Json(json!({
            "task": TaskView::new(&task, false),
            "persistedAt": persisted_at,
        }))
        .into_response());
    }

    let tasks: Vec<TaskView> = state
        .tasks
        .list()
        .iter()
        .map(|task| TaskView::new(task, false))
        .collect();
    Ok(Json(json!({
        "tasks": tasks,
        "stats": state.tasks.stats(),
        "persistedAt": persisted_at,
    }))
    .into_response())
}

/// `GET /api/agent/result?id[&logs=1]`.
pub async fn result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Rejected("Missing id".into()))?;
    let detailed = query
        .logs
        .is_some_and(|logs| truthy(&Value::String(logs)));
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| AppError::NotFound("Task not found".into()))?;
    Ok(Json(json!({
        "task": TaskView::new(&task, detailed),
        "persistedAt": state.tasks.persisted_at(),
    }))
    .into_response())
}

/// `POST /api/agent/done` body.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DoneRequest {
    #[serde(deserialize_with = "crate::models::deserialize_task_id")]
    id: String,
    done: Option<bool>,
}

/// `POST /api/agent/done`.
pub async fn mark_done(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: DoneRequest = parse_body(&body)?;
    if request.id.is_empty() {
        return Err(AppError::Rejected("Missing id".into()).into());
    }
    let task = state.tasks.mark_done(&request.id, request.done.unwrap_or(true))?;
    Ok(Json(json!({ "task": TaskView::new(&task, false) })).into_response())
}
