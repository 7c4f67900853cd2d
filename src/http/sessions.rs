//! Interactive session routes under `/api/pty/sessions`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use super::ApiError;
use crate::state::AppState;
use crate::AppError;

/// `GET /api/pty/sessions`.
pub async fn list(State(state): State<Arc<AppState>>) -> Response {
    let sessions = state.sessions.list();
    Json(json!({ "count": sessions.len(), "sessions": sessions })).into_response()
}

/// `DELETE /api/pty/sessions/{id}`: ask the owning connection to dispose
/// of the session.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.sessions.stop(&id) {
        return Err(AppError::NotFound(format!("session {id}")).into());
    }
    info!(session_id = %id, "session stop requested over http");
    Ok(Json(json!({ "stopped": true, "id": id })).into_response())
}
