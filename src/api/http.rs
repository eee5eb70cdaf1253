//! HTTP API Server
//!
//! REST API for executing operations, fault injection and inspecting the
//! ledger, locks and operation log.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::coordinator::{OperationLogEntry, TransactionCoordinator};
use crate::error::{Error, Result};
use crate::lock::WriteMarker;
use crate::node::{NodeId, NodeState, NodeStatus};
use crate::operation::IsolationLevel;
use crate::replication::ReplicationEntry;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<TransactionCoordinator>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { coordinator }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let router = create_router(Arc::clone(&self.state));
        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/query", post(handle_query))
        .route("/nodes/:node/kill", post(handle_kill))
        .route("/nodes/:node/recover", post(handle_recover))
        .route("/health", get(handle_health))
        .route("/replication", get(handle_replication))
        .route("/replication/stats", get(handle_replication_stats))
        .route("/locks", get(handle_locks))
        .route("/logs", get(handle_logs).delete(handle_clear_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Request/Response Types ============

/// Execute request
#[derive(Debug, Deserialize, Serialize)]
pub struct QueryRequest {
    pub node: String,
    pub query: String,
    #[serde(default)]
    pub isolation: IsolationLevel,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub nodes: BTreeMap<NodeId, NodeState>,
}

/// Ledger response
#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerResponse {
    pub count: usize,
    pub entries: Vec<ReplicationEntry>,
}

/// Active locks response
#[derive(Debug, Serialize, Deserialize)]
pub struct LocksResponse {
    pub count: usize,
    pub locks: Vec<WriteMarker>,
}

/// Operation log response
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub count: usize,
    pub entries: Vec<OperationLogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
}

/// HTTP status for an error
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NodeOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::LockTimeout { .. } | Error::ReadTimeout { .. } => StatusCode::CONFLICT,
        Error::Store { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Parse(_) | Error::UnknownNode(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    (
        status_for(&err),
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
            retryable: err.is_retryable(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    let node = match NodeId::from_str(&req.node) {
        Ok(node) => node,
        Err(e) => return error_response(e),
    };

    match state.coordinator.execute(node, &req.query, req.isolation).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_kill(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Response {
    match NodeId::from_str(&node) {
        Ok(node) => Json(state.coordinator.kill(node).await).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_recover(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Response {
    match NodeId::from_str(&node) {
        Ok(node) => Json(state.coordinator.recover(node).await).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let nodes = state.coordinator.health().await;
    let healthy = nodes.values().all(|s| s.status == NodeStatus::Online);
    Json(HealthResponse { healthy, nodes })
}

async fn handle_replication(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = state.coordinator.ledger().await;
    Json(LedgerResponse {
        count: entries.len(),
        entries,
    })
}

async fn handle_replication_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.ledger_stats().await)
}

async fn handle_locks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let locks = state.coordinator.locks();
    Json(LocksResponse {
        count: locks.len(),
        locks,
    })
}

async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    let entries = state.coordinator.logs(params.limit).await;
    Json(LogsResponse {
        count: entries.len(),
        entries,
    })
}

async fn handle_clear_logs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cleared = state.coordinator.clear_logs().await;
    tracing::info!("Cleared {} operation log entries", cleared);
    Json(serde_json::json!({ "cleared": cleared }))
}
