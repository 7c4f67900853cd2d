//! HTTP surface: REST routes and the `/ws/pty` upgrade path.

pub mod health;
pub mod sessions;
pub mod tasks;
pub mod upgrade;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AppState;
use crate::{AppError, Result};

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/pty", get(upgrade::ws_pty))
        .route("/api/health", get(health::health))
        .route("/api/claude/health", get(health::claude_health))
        .route("/api/logs", get(health::logs))
        .route("/api/agent/submit", post(tasks::submit_claude))
        .route("/api/agent/status", get(tasks::status))
        .route("/api/agent/result", get(tasks::result))
        .route("/api/agent/done", post(tasks::mark_done))
        .route("/api/codex/submit", post(tasks::submit_codex))
        .route("/api/codex/chat", post(tasks::codex_chat))
        .route("/api/claude/chat", post(tasks::claude_chat))
        .route("/api/pty/sessions", get(sessions::list))
        .route("/api/pty/sessions/{id}", delete(sessions::stop))
        .fallback(not_found)
        .layer(middleware::from_fn(reject_stray_upgrades))
        .with_state(state)
}

/// Serve `router(state)` on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http server shut down");
    Ok(())
}

/// WebSocket upgrades are only served on `/ws/pty`; anywhere else they get
/// the JSON 404 whether or not a plain route exists at that path.
async fn reject_stray_upgrades(request: Request, next: Next) -> Response {
    let wants_websocket = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    if wants_websocket && request.uri().path() != "/ws/pty" {
        return not_found().await;
    }
    next.run(request).await
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// [`AppError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            AppError::Config(_) | AppError::Rejected(_) | AppError::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Bridge(_) | AppError::Task(_) | AppError::Persistence(_) | AppError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Parse an optional JSON body; an empty body is `T::default()`.
pub(crate) fn parse_body<T>(body: &Bytes) -> std::result::Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError(AppError::Rejected(format!("invalid request body: {err}"))))
}
