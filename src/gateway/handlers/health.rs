use std::collections::BTreeMap;
use std::sync::OnceLock;

use axum::{extract::State, response::IntoResponse, Json};

use crate::gateway::AppState;

pub(crate) static STARTUP_TIME: OnceLock<std::time::Instant> = OnceLock::new();

/// `GET /api/status`
pub(crate) async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = STARTUP_TIME
        .get()
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(0);

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    if let Ok(caps) = state.runtime.catalog.list(None) {
        for cap in caps {
            *counts.entry(cap.status.as_str()).or_default() += 1;
        }
    }

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "capabilities": counts,
    }))
}
