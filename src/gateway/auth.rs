use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware,
    response::IntoResponse,
    Json,
};

use serde::Deserialize;

use super::AppState;

/// `?token=` query parameter, percent-decoded by the extractor.
#[derive(Deserialize)]
pub(crate) struct TokenQuery {
    pub(crate) token: Option<String>,
}

/// Bearer token check; `?token=` is accepted for EventSource clients that
/// cannot set headers.
pub(crate) async fn auth_middleware(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    req: Request<Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    let Some(ref expected) = state.api_token else {
        return next.run(req).await;
    };

    let header_token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);
    match header_token.or(query.token) {
        Some(ref token) if token == expected => next.run(req).await,
        Some(_) => unauthorized("invalid token"),
        None => unauthorized("missing or invalid Authorization header"),
    }
}

fn unauthorized(message: &str) -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Reject ids that could escape a directory or smuggle separators.
pub(crate) fn validate_id(s: &str) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    crate::utils::validate_segment(s).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid id", "value": s })),
        )
    })
}
