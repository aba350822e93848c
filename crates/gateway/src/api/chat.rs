//! Chat endpoints — the SSE projection of the engine event stream.
//!
//! Events map onto the AI-SDK custom-data schema: progress events become
//! `{"type": "data-<event>", "data": {...}}` frames, assistant text
//! becomes `text-start` / `text-delta` / `text-end` triples, failures
//! become `{"type": "error", "errorText": ...}`. Every stream terminates
//! with `data: [DONE]`.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_core::Stream;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use ta_domain::event::EngineEvent;
use ta_engine::EngineOptions;

use crate::api::auth::require_auth;
use crate::session_lock::SessionBusy;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// User task text.
    pub message: String,
    /// Explicit session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Model or tier override (e.g. "fast", "gpt-4o").
    #[serde(default)]
    pub model: Option<String>,
}

fn engine_options(state: &AppState, body: &ChatRequest, session_id: &str) -> EngineOptions {
    EngineOptions {
        session_id: Some(session_id.to_string()),
        model: body.model.as_deref().map(|m| state.llm.resolve_model(m)),
        ..Default::default()
    }
}

fn resolve_session(body: &ChatRequest) -> String {
    body.session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> axum::response::Response {
    run_stream(state, headers, body, false).await
}

/// POST /command — identical to /chat with a leading `data-mode` frame.
pub async fn command_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> axum::response::Response {
    run_stream(state, headers, body, true).await
}

async fn run_stream(
    state: AppState,
    headers: HeaderMap,
    body: ChatRequest,
    command_mode: bool,
) -> axum::response::Response {
    if let Err(status) = require_auth(&state, &headers) {
        return status.into_response();
    }

    let session_id = resolve_session(&body);
    let permit = match state.session_locks.acquire(&session_id) {
        Ok(permit) => permit,
        Err(SessionBusy) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "session is busy — a run is already in progress" })),
            )
                .into_response();
        }
    };

    let opts = engine_options(&state, &body, &session_id);
    let (_handle, mut rx) = state.engine.run(body.message, opts);

    let stream = async_stream::stream! {
        // Tie the session permit to the stream lifetime.
        let _permit = permit;

        if command_mode {
            yield sse_json(json!({ "type": "data-mode", "data": { "mode": "command" } }));
        }

        while let Some(event) = rx.recv().await {
            for frame in event_frames(&event) {
                yield sse_json(frame);
            }
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    sse_response(stream).into_response()
}

fn sse_response(
    stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_json(value: serde_json::Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(value.to_string()))
}

/// Project one engine event onto its SSE frames.
fn event_frames(event: &EngineEvent) -> Vec<serde_json::Value> {
    match event {
        EngineEvent::Reasoning { iteration, text } => {
            let id = format!("text-{iteration}");
            vec![
                json!({ "type": "text-start", "id": id }),
                json!({ "type": "text-delta", "id": id, "delta": text }),
                json!({ "type": "text-end", "id": id }),
            ]
        }
        EngineEvent::Error { error, .. } => {
            vec![json!({ "type": "error", "errorText": error.user_message() })]
        }
        EngineEvent::Failed { .. } => {
            let data = serde_json::to_value(event).unwrap_or_default();
            vec![
                json!({ "type": "data-failed", "data": data }),
                json!({
                    "type": "error",
                    "errorText": "The task could not be completed."
                }),
            ]
        }
        other => {
            let data = serde_json::to_value(other).unwrap_or_default();
            vec![json!({ "type": format!("data-{}", other.type_name()), "data": data })]
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat-sync
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> axum::response::Response {
    if let Err(status) = require_auth(&state, &headers) {
        return status.into_response();
    }

    let session_id = resolve_session(&body);
    let _permit = match state.session_locks.acquire(&session_id) {
        Ok(permit) => permit,
        Err(SessionBusy) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "session is busy — a run is already in progress" })),
            )
                .into_response();
        }
    };

    let opts = engine_options(&state, &body, &session_id);
    let (_handle, mut rx) = state.engine.run(body.message, opts);

    let mut summary: Option<String> = None;
    let mut error: Option<String> = None;
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Complete { summary: text, .. } => summary = Some(text),
            EngineEvent::Failed { reason, .. } => error = Some(reason),
            EngineEvent::Timeout { .. } => {
                error = Some("the task ran out of iterations".into())
            }
            EngineEvent::Cancelled { reason, .. } => error = Some(reason),
            EngineEvent::Interrupted {
                clarification_id, ..
            } => {
                error = Some(format!(
                    "clarification needed (id {clarification_id}); answer and retry"
                ))
            }
            _ => {}
        }
    }

    Json(json!({
        "success": error.is_none(),
        "session_id": session_id,
        "summary": summary,
        "error": error,
    }))
    .into_response()
}
