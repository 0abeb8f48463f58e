//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ErrorResponse, ModeRequest, QueuedResponse, SendRequest, SessionMessagesResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::relay::serve_socket;
use crate::runtime::SseEvent;
use crate::state_machine::Event;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

/// Longest accepted console id
const MAX_CONSOLE_ID_LEN: usize = 64;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Console intents
        .route("/api/consoles/:id/start", post(start_session))
        .route("/api/consoles/:id/end", post(end_session))
        .route("/api/consoles/:id/send", post(send_text))
        .route("/api/consoles/:id/mode", post(set_mode))
        .route("/api/consoles/:id/toggle-mic", post(toggle_microphone))
        // Live updates
        .route("/api/consoles/:id/stream", get(stream_console))
        // Avatar page relay
        .route("/api/consoles/:id/relay", get(relay_socket))
        // Session log read-back
        .route("/api/sessions/:id/messages", get(session_messages))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Console Intents
// ============================================================

async fn queue(state: &AppState, id: &str, event: Event) -> Result<Json<QueuedResponse>, AppError> {
    validate_console_id(id)?;
    state
        .runtime
        .send_event(id, event)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(QueuedResponse { queued: true }))
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::Start).await
}

async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::End).await
}

async fn send_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::SendText { text: req.text }).await
}

async fn set_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ModeRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::SetMode { mode: req.mode }).await
}

async fn toggle_microphone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueuedResponse>, AppError> {
    queue(&state, &id, Event::ToggleMicrophone).await
}

// ============================================================
// Streaming
// ============================================================

async fn stream_console(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validate_console_id(&id)?;
    let (snapshot, broadcast_rx) = state.runtime.subscribe(&id).await;
    let init = SseEvent::Init {
        state: serde_json::to_value(&snapshot).unwrap_or(Value::Null),
    };
    Ok(sse_stream(init, broadcast_rx))
}

async fn relay_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    validate_console_id(&id)?;
    let hub = state.runtime.relays().clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(hub, id, socket)))
}

// ============================================================
// Session Log
// ============================================================

async fn session_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionMessagesResponse>, AppError> {
    let db = state.runtime.db();
    db.get_session(&id).map_err(|e| match e {
        DbError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
        other => AppError::Internal(other.to_string()),
    })?;

    let messages = db
        .list_messages(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .into_iter()
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .collect();

    Ok(Json(SessionMessagesResponse {
        session_id: id,
        messages,
    }))
}

async fn get_version() -> &'static str {
    concat!("avatar-session ", env!("CARGO_PKG_VERSION"))
}

fn validate_console_id(id: &str) -> Result<(), AppError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_CONSOLE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("Invalid console id: {id}")))
    }
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
