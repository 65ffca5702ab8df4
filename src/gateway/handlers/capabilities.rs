use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::error_response;
use crate::capabilities::CapabilityStatus;
use crate::gateway::auth::validate_id;
use crate::gateway::AppState;

#[derive(Deserialize)]
pub(crate) struct CapabilityQuery {
    id: Option<String>,
    name: Option<String>,
    status: Option<String>,
}

/// `GET /api/capabilities[?id=|?name=|?status=]`
pub(crate) async fn api_capabilities_get(
    State(state): State<AppState>,
    Query(query): Query<CapabilityQuery>,
) -> impl IntoResponse {
    let catalog = &state.runtime.catalog;

    let single = match (query.id.as_deref(), query.name.as_deref()) {
        (Some(id), _) => Some(catalog.get(id)),
        (None, Some(name)) => Some(catalog.get_by_name(name)),
        (None, None) => None,
    };
    if let Some(result) = single {
        return match result {
            Ok(Some(cap)) => Json(json!({ "capability": cap })).into_response(),
            Ok(None) => error_response(StatusCode::NOT_FOUND, "capability not found"),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        };
    }

    let status = match query.status.as_deref().map(str::parse::<CapabilityStatus>) {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match catalog.list(status) {
        Ok(caps) => Json(json!({ "capabilities": caps })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize)]
pub(crate) struct StatusRequest {
    status: String,
}

/// `POST /api/capabilities/:id/status`
pub(crate) async fn api_capability_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_id(&id) {
        return e.into_response();
    }
    let status: CapabilityStatus = match req.status.parse() {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let catalog = &state.runtime.catalog;
    match catalog.get(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "capability not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
    match catalog.set_status(&id, status) {
        Ok(cap) => {
            info!(capability_id = %id, status = %status, "capability status changed via API");
            Json(json!({ "capability": cap })).into_response()
        }
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

#[derive(Deserialize)]
pub(crate) struct SecretRequest {
    capability_id: Option<String>,
    build_id: Option<String>,
    name: Option<String>,
    value: Option<String>,
}

/// `POST /api/capabilities/secrets`: store a secret; when a build is
/// waiting for it, confirm on the build's `to_builder` queue.  The value is
/// never echoed back.
pub(crate) async fn api_secret_set(
    State(state): State<AppState>,
    Json(req): Json<SecretRequest>,
) -> impl IntoResponse {
    let (Some(capability_id), Some(name), Some(value)) = (
        req.capability_id.filter(|s| !s.is_empty()),
        req.name.filter(|s| !s.is_empty()),
        req.value.filter(|s| !s.is_empty()),
    ) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "capability_id, name, and value are required",
        );
    };

    let runtime = &state.runtime;
    match runtime.catalog.get(&capability_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "capability not found"),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
    if let Err(e) = runtime.secrets.set(&capability_id, &name, &value) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    if let Some(build_id) = req.build_id.filter(|s| !s.is_empty()) {
        let answer = format!("Secret \"{name}\" saved successfully.");
        if let Err(e) = runtime.relay.push_answer(&build_id, &answer) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    }
    info!(capability_id = %capability_id, key = %name, "secret stored via API");
    Json(json!({ "success": true, "name": name })).into_response()
}
