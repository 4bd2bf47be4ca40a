//! HTTP surface: webhook intake, approver endpoints, operator views and
//! the live approval feed.

mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::channels::{BroadcastNotifier, PollerStatus};
use crate::error::{DatabaseError, IngestError, WorkflowError};
use crate::pipeline::InboundMatcher;
use crate::store::Database;
use crate::workflow::{ApprovalGate, PassDispatcher};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub matcher: Arc<InboundMatcher>,
    pub gate: Arc<ApprovalGate>,
    pub dispatcher: PassDispatcher,
    /// Source of the `/ws/approvals` feed.
    pub approvals_feed: Arc<BroadcastNotifier>,
    pub poller: Arc<PollerStatus>,
}

/// Build the router with every REST and WebSocket route.
pub fn api_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/events", post(routes::ingest_event))
        .route("/api/approvals/pending", get(routes::pending_approvals))
        .route("/api/approvals/history", get(routes::approval_history))
        .route("/api/approvals/respond", post(routes::respond))
        .route("/api/workflows", get(routes::list_workflows))
        .route("/api/workflows/{id}", get(routes::get_workflow))
        .route("/api/workflows/{id}/trigger", post(routes::trigger_workflow))
        .route("/api/poller/status", get(routes::poller_status))
        .route("/ws/approvals", get(ws::approvals_feed))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Error body returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Workflow(WorkflowError),
    Ingest(IngestError),
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self::Workflow(e)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::Workflow(WorkflowError::Database(e))
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::Ingest(e)
    }
}

fn workflow_status(e: &WorkflowError) -> StatusCode {
    match e {
        WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
        WorkflowError::DuplicateDecision { .. } | WorkflowError::ConcurrencyConflict { .. } => {
            StatusCode::CONFLICT
        }
        WorkflowError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::Executor(_)
        | WorkflowError::DispatcherClosed
        | WorkflowError::PassAborted { .. }
        | WorkflowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Workflow(e) => (workflow_status(e), e.to_string()),
            Self::Ingest(IngestError::InvalidEvent(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Ingest(IngestError::Workflow(e)) => (workflow_status(e), e.to_string()),
            Self::Ingest(e @ IngestError::Database(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        if status.is_server_error() {
            error!(status = %status, error = %message, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
