//! HTTP boundary for login triggers and dashboard polling.
//!
//! # Routes
//!
//! ```text
//! POST /sessions                   {"user_id"} ──→ 202 {status, session_id}
//! GET  /sessions/:user_id/latest   ──→ SessionRecord | 404
//! GET  /health
//! ```
//!
//! A login returns as soon as the session is accepted; the dashboard then
//! polls the latest record until its status is terminal.

use crate::core::{SessionError, SessionRecord};
use crate::source::SourceError;
use crate::store::{SessionStore, StoreError};
use crate::supervisor::SessionSupervisor;
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
pub struct ServerState {
    supervisor: SessionSupervisor,
    store: Arc<dyn SessionStore>,
}

impl ServerState {
    pub fn new(supervisor: SessionSupervisor, store: Arc<dyn SessionStore>) -> Self {
        Self { supervisor, store }
    }
}

/// Login trigger body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
}

/// Acknowledgement for an accepted login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    pub session_id: Uuid,
    pub user_id: String,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn session_error(e: SessionError) -> ApiError {
    let (status, code) = match &e {
        SessionError::SessionAlreadyActive(_) => (StatusCode::CONFLICT, "SESSION_ACTIVE"),
        SessionError::Source(SourceError::PortBusy(_)) => (StatusCode::LOCKED, "PORT_BUSY"),
        SessionError::Source(_) => (StatusCode::BAD_GATEWAY, "CONNECTION_ERROR"),
        SessionError::InvalidState { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INVALID_STATE"),
    };
    api_error(status, code, e)
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::InvalidUser(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_USER", e),
        _ => {
            tracing::error!(error = %e, "store read failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e)
        }
    }
}

/// GET /health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.supervisor.active_users().len(),
    })
}

/// POST /sessions
async fn submit(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_USER",
            "user_id must not be empty",
        ));
    }

    // Opening the sensor blocks on device I/O
    let supervisor = state.supervisor.clone();
    let owner = user_id.to_string();
    let ticket = tokio::task::spawn_blocking(move || supervisor.submit(&owner))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "session submit task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e)
        })?
        .map_err(session_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status: "accepted".to_string(),
            session_id: ticket.session_id,
            user_id: ticket.user_id.clone(),
        }),
    ))
}

/// GET /sessions/:user_id/latest
async fn latest(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    match state.store.get_latest_session(&user_id).map_err(store_error)? {
        Some(record) => Ok(Json(record)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("no session for user {user_id}"),
        )),
    }
}

/// Build the router on top of existing state.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(submit))
        .route("/sessions/:user_id/latest", get(latest))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    supervisor: SessionSupervisor,
    store: Arc<dyn SessionStore>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(Arc::new(ServerState::new(supervisor.clone(), store)));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Session agent server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
                supervisor.shutdown();
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
