use crate::emitter::{StreamEmitter, StreamEvent};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PostMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduledFireRequest {
    description: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v1/conversations/{id}/messages",
            post(post_message).get(list_messages),
        )
        .route("/api/v1/conversations/{id}/scheduled", post(scheduled_fire))
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error.to_string() })),
    )
        .into_response()
}

/// Runs a chat turn and streams its events. Dropping the response stream
/// (client disconnect) cancels the turn.
#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn post_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Response {
    if req.content.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content must not be empty");
    }

    let (emitter, rx) = StreamEmitter::channel();
    let cancel = CancellationToken::new();
    let handle = state.registry.handle(&id);
    let turn_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.chat_turn(req.content, emitter, turn_cancel).await {
            tracing::warn!(conversation_id = %handle.id(), error = %e, "chat turn ended with error");
        }
    });

    let guard = cancel.drop_guard();
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((sse_event(&event), (rx, guard)))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event)
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %id))]
async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.snapshot(&id).await {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn scheduled_fire(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ScheduledFireRequest>,
) -> Response {
    if req.description.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "description must not be empty");
    }
    match state
        .registry
        .handle(&id)
        .handle_scheduled_fire(req.description)
        .await
    {
        Ok(message) => {
            Json(serde_json::json!({ "status": "ok", "message_id": message.id })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
