//! HTTP API surface.
//!
//! - `POST /chat`                    — SSE stream of engine events
//! - `POST /chat-sync`               — single JSON result
//! - `POST /command`                 — SSE with a leading `data-mode` frame
//! - `POST /sessions/:id/stop`       — cancel a running session
//! - `GET  /sessions/:id/staleness`  — checkpoint staleness report
//! - `GET  /health`                  — readiness and provider status

pub mod auth;
pub mod chat;
pub mod sessions;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::chat_stream))
        .route("/chat-sync", post(chat::chat_sync))
        .route("/command", post(chat::command_stream))
        .route("/sessions/:session_id/stop", post(sessions::stop))
        .route("/sessions/:session_id/staleness", get(sessions::staleness))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.llm.ids(),
        "defaultProvider": state
            .llm
            .default_provider()
            .map(|p| p.provider_id().to_string()),
        "timestamp": chrono::Utc::now(),
    }))
}
