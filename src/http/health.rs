//! Health and log-tail routes.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::logbuf::DEFAULT_LOG_CAPACITY;
use crate::state::AppState;

/// Lines returned by `/api/logs` without `limit`.
const DEFAULT_LOG_LIMIT: usize = 200;

/// `GET /api/health`.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "port": state.port,
        "pid": std::process::id(),
        "startedAt": state.started_at,
        "uptimeSeconds": uptime,
        "tasks": state.tasks.stats(),
        "sessions": state.sessions.len(),
    }))
    .into_response()
}

/// `GET /api/claude/health`: whether batch Claude tasks can start.
pub async fn claude_health(State(state): State<Arc<AppState>>) -> Response {
    let path = state.config.claude.mcp_config_path.as_ref();
    Json(json!({
        "status": "ok",
        "host": state.config.server.bind,
        "port": state.port,
        "mcp_config_path": path.map(|p| p.display().to_string()),
        "mcp_config_exists": path.is_some_and(|p| p.exists()),
    }))
    .into_response()
}

/// `?limit=N&since=<timestamp prefix>`.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    limit: Option<String>,
    since: Option<String>,
}

/// `GET /api/logs`.
pub async fn logs(State(state): State<Arc<AppState>>, Query(query): Query<LogQuery>) -> Response {
    let limit = query
        .limit
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(DEFAULT_LOG_CAPACITY);
    let lines = state.logs.lines(limit, query.since.as_deref());
    Json(json!({ "count": lines.len(), "lines": lines })).into_response()
}
