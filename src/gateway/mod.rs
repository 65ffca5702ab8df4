//! HTTP + WebSocket gateway.
//!
//! Serves:
//! - `GET  /api/status`                          liveness and catalog counts
//! - `POST /api/chat`                            run one agent turn
//! - `POST /api/builder`                         queue a build
//! - `GET  /api/builder/:build_id/messages`      poll (or `?peek=true`) relay messages
//! - `GET  /api/builder/:build_id/stream`        SSE of relay messages
//! - `POST /api/builder/:build_id/answer`        answer a builder question
//! - `GET  /api/capabilities`                    list or look up capabilities
//! - `POST /api/capabilities/:id/status`         lifecycle transition
//! - `POST /api/capabilities/secrets`            store a capability secret
//! - `GET  /ws`, `GET /ws/logs`                  event and log streams
//!
//! `/api` routes require `TOOLSMITH_API_TOKEN` when it is set.

mod auth;
mod handlers;
mod ws;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::runtime::Runtime;

pub const API_TOKEN_ENV: &str = "TOOLSMITH_API_TOKEN";

// ---------------------------------------------------------------------------
// Global event channel (so other modules can publish events)
// ---------------------------------------------------------------------------

static GLOBAL_EVENTS_TX: OnceLock<broadcast::Sender<String>> = OnceLock::new();

/// The process-wide event channel, created on first use.
pub fn events_tx() -> broadcast::Sender<String> {
    GLOBAL_EVENTS_TX
        .get_or_init(|| broadcast::channel::<String>(256).0)
        .clone()
}

/// Serialize `value` as JSON and broadcast it to all WebSocket clients.
///
/// No-op until the gateway (or anything else) created the channel.
pub fn publish_event_json(value: &serde_json::Value) {
    let Some(tx) = GLOBAL_EVENTS_TX.get() else {
        return;
    };
    match serde_json::to_string(value) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!(error = %e, "gateway: failed to serialize event"),
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) events_tx: broadcast::Sender<String>,
    pub(crate) api_token: Option<String>,
}

/// Handle returned by [`start_gateway`].
pub struct Gateway {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub fn router(runtime: Arc<Runtime>, api_token: Option<String>) -> Router {
    let state = AppState {
        runtime,
        events_tx: events_tx(),
        api_token,
    };

    let api = Router::new()
        .route("/status", get(handlers::health::status_handler))
        .route("/chat", post(handlers::chat::api_chat))
        .route("/builder", post(handlers::builder::api_build_start))
        .route("/builder/:build_id/messages", get(handlers::builder::api_build_messages))
        .route("/builder/:build_id/stream", get(handlers::builder::api_build_stream))
        .route("/builder/:build_id/answer", post(handlers::builder::api_build_answer))
        .route("/capabilities", get(handlers::capabilities::api_capabilities_get))
        .route("/capabilities/secrets", post(handlers::capabilities::api_secret_set))
        .route("/capabilities/:id/status", post(handlers::capabilities::api_capability_status))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws::ws_handler))
        .route("/ws/logs", get(ws::ws_logs_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn start_gateway(
    runtime: Arc<Runtime>,
    addr: SocketAddr,
    api_token: Option<String>,
    shutdown: CancellationToken,
) -> std::io::Result<Gateway> {
    if api_token.is_some() {
        info!("API authentication enabled ({API_TOKEN_ENV} set)");
    } else {
        warn!("API authentication disabled ({API_TOKEN_ENV} not set)");
    }
    let _ = handlers::health::STARTUP_TIME.set(std::time::Instant::now());

    let app = router(runtime, api_token);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!("gateway server error: {e}");
        }
    });

    info!(%bound_addr, "gateway started");
    Ok(Gateway {
        addr: bound_addr,
        handle,
    })
}

/// Token from the environment; empty counts as unset.
pub fn api_token_from_env() -> Option<String> {
    std::env::var(API_TOKEN_ENV).ok().filter(|s| !s.is_empty())
}
