use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use tokio::sync::broadcast;
use tracing::debug;

use super::auth::TokenQuery;
use super::AppState;

/// Browsers cannot set headers on a WebSocket upgrade, so the token rides
/// in the query string.
fn authorized(state: &AppState, query: &TokenQuery) -> bool {
    match &state.api_token {
        None => true,
        Some(expected) => query.token.as_deref() == Some(expected.as_str()),
    }
}

/// `GET /ws`: tool and build events.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if !authorized(&state, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let rx = state.events_tx.subscribe();
    ws.on_upgrade(move |socket| forward(socket, rx)).into_response()
}

/// `GET /ws/logs`: live log lines.
pub(crate) async fn ws_logs_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if !authorized(&state, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(|mut socket| async move {
        match crate::logs::subscribe() {
            Some(rx) => forward(socket, rx).await,
            None => {
                let _ = socket
                    .send(Message::Text(
                        r#"{"type":"error","message":"log broadcast not initialised"}"#.into(),
                    ))
                    .await;
            }
        }
    })
    .into_response()
}

/// Pump a broadcast channel into the socket until either side goes away.
/// Client messages are ignored.
async fn forward(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(line) => {
                    if socket.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "ws client lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
}
