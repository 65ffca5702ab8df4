pub(crate) mod builder;
pub(crate) mod capabilities;
pub(crate) mod chat;
pub(crate) mod health;

use axum::{http::StatusCode, response::IntoResponse, Json};

/// `{ "error": ... }` with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl std::fmt::Display) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}
