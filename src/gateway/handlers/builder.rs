use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::error_response;
use crate::builder::BuildJob;
use crate::gateway::auth::validate_id;
use crate::gateway::AppState;
use crate::relay::{Direction, MessageKind};

const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STREAM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Deserialize)]
pub(crate) struct BuildRequest {
    build_id: Option<String>,
    #[serde(default)]
    description: String,
}

/// `POST /api/builder`: queue a build and return its id immediately.
pub(crate) async fn api_build_start(
    State(state): State<AppState>,
    Json(req): Json<BuildRequest>,
) -> impl IntoResponse {
    if req.description.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "description is required");
    }

    let job = match req.build_id {
        Some(id) => {
            if let Err(e) = validate_id(&id) {
                return e.into_response();
            }
            // A build id naming a catalog entry builds that entry.
            match state.runtime.catalog.get(&id) {
                Ok(Some(cap)) => BuildJob::for_capability(cap.id, cap.name, req.description),
                Ok(None) => BuildJob {
                    build_id: id,
                    ..BuildJob::new(req.description)
                },
                Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
            }
        }
        None => BuildJob::new(req.description),
    };

    let build_id = job.build_id.clone();
    if let Err(e) = state.runtime.builds.submit(job).await {
        warn!(build_id = %build_id, error = %e, "failed to queue build");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e);
    }
    info!(build_id = %build_id, "build accepted");
    Json(json!({ "build_id": build_id })).into_response()
}

#[derive(Deserialize)]
pub(crate) struct MessagesQuery {
    #[serde(default)]
    peek: bool,
}

/// `GET /api/builder/:build_id/messages`: consume (or peek at) the
/// `to_user` queue.
pub(crate) async fn api_build_messages(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    if let Err(e) = validate_id(&build_id) {
        return e.into_response();
    }
    let relay = &state.runtime.relay;
    let result = if query.peek {
        relay.peek(&build_id, Direction::ToUser)
    } else {
        relay.poll(&build_id, Direction::ToUser)
    };
    match result {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `GET /api/builder/:build_id/stream`: server-sent events of `to_user`
/// messages until the build completes, fails, or ten minutes pass.
pub(crate) async fn api_build_stream(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = validate_id(&build_id) {
        return e.into_response();
    }
    let relay = state.runtime.relay.clone();

    let stream = async_stream::stream! {
        let started = Instant::now();
        loop {
            if started.elapsed() > STREAM_TIMEOUT {
                let timeout = json!({
                    "kind": "error",
                    "payload": { "error": "Build timed out", "recoverable": false },
                });
                yield Ok::<_, Infallible>(Event::default().data(timeout.to_string()));
                break;
            }

            let messages = match relay.poll(&build_id, Direction::ToUser) {
                Ok(m) => m,
                Err(e) => {
                    warn!(build_id = %build_id, error = %e, "relay poll failed");
                    Vec::new()
                }
            };
            let mut done = false;
            for msg in messages {
                done |= matches!(msg.kind, MessageKind::Complete | MessageKind::Error);
                match serde_json::to_string(&msg) {
                    Ok(data) => yield Ok(Event::default().data(data)),
                    Err(e) => warn!(error = %e, "failed to encode relay message"),
                }
            }
            if done {
                break;
            }
            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Deserialize)]
pub(crate) struct AnswerRequest {
    answer: String,
}

/// `POST /api/builder/:build_id/answer`
pub(crate) async fn api_build_answer(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_id(&build_id) {
        return e.into_response();
    }
    match state.runtime.relay.push_answer(&build_id, &req.answer) {
        Ok(msg) => Json(json!({ "success": true, "id": msg.id })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
