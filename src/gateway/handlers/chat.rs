use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use tracing::{error, info};

use super::error_response;
use crate::gateway::AppState;
use crate::models::ChatMessage;

#[derive(Deserialize)]
pub(crate) struct HistoryItem {
    role: String,
    content: String,
}

#[derive(Deserialize)]
pub(crate) struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<HistoryItem>,
}

/// `POST /api/chat`: run one turn over the supplied history.  A requested
/// build is queued before the reply is returned.
pub(crate) async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    if req.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is required");
    }

    let mut messages: Vec<ChatMessage> = req
        .history
        .into_iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ChatMessage::new(m.role, m.content))
        .collect();
    messages.push(ChatMessage::new("user", req.message));

    match state.runtime.agent.respond(&messages).await {
        Ok(outcome) => {
            info!(
                tool_calls = outcome.tool_calls.len(),
                pending = outcome.pending_question.is_some(),
                "chat turn finished"
            );
            Json(outcome).into_response()
        }
        Err(e) => {
            error!(error = %e, "chat turn failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
