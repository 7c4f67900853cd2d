//! `GET /ws/pty`: hand the upgraded socket to the connection actor.
//!
//! The handshake is answered here; everything after the `101` response is
//! read and written through [`FrameCodec`](crate::ws::frame::FrameCodec).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::state::AppState;
use crate::ws::connection::run_connection;
use crate::ws::handshake::UpgradeRequest;

/// Validate the upgrade, answer `101` and spawn the connection task.
pub async fn ws_pty(State(state): State<Arc<AppState>>, mut request: Request) -> Response {
    let upgrade = match UpgradeRequest::from_headers(request.headers()) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            warn!(%err, "rejected websocket upgrade");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    let headers = match upgrade.response_headers() {
        Ok(headers) => headers,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let on_upgrade = hyper::upgrade::on(&mut request);
    let connection_id = Uuid::new_v4().to_string();
    let span = info_span!("connection", connection_id = %connection_id);

    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => run_connection(TokioIo::new(upgraded), state, connection_id).await,
                Err(err) => warn!(%err, "websocket upgrade failed"),
            }
        }
        .instrument(span),
    );

    (StatusCode::SWITCHING_PROTOCOLS, headers).into_response()
}
