//! Session control endpoints.
//!
//! - `POST /sessions/:id/stop`      — cancel a running session (cascades
//!   to delegated sub-agents)
//! - `GET  /sessions/:id/staleness` — staleness report for the session's
//!   checkpoint, gating resumption

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::api::auth::require_auth;
use crate::state::AppState;

pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> axum::response::Response {
    if let Err(status) = require_auth(&state, &headers) {
        return status.into_response();
    }

    let found = state.cancel_map.cancel(&session_id);
    if found {
        tracing::info!(session_id = %session_id, "session stop requested");
        Json(json!({ "stopped": true, "session_id": session_id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no running session with that id" })),
        )
            .into_response()
    }
}

pub async fn staleness(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> axum::response::Response {
    if let Err(status) = require_auth(&state, &headers) {
        return status.into_response();
    }

    match ta_engine::checkpoint::load_for_resume(state.checkpoints.as_ref(), &session_id, None) {
        Ok((doc, report)) => Json(json!({
            "session_id": session_id,
            "report": report,
            "resumable": doc.is_some(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
