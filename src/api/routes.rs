//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::error::WorkflowError;
use crate::pipeline::{InboundEvent, IngestOutcome};
use crate::workflow::model::{
    ApprovalRequest, AuditEntry, Decision, InstanceStatus, PassTrigger, WorkflowInstance,
};
use crate::workflow::{DecisionReceipt, PassReport};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

// ── Health ──────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "hire-flow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Inbound events ──────────────────────────────────────────────────

pub async fn ingest_event(
    State(state): State<AppState>,
    body: Result<Json<InboundEvent>, JsonRejection>,
) -> Result<Json<IngestOutcome>, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let outcome = state.matcher.ingest(&event).await?;
    info!(message_id = %event.message_id, outcome = outcome.label(), "Webhook event ingested");
    Ok(Json(outcome))
}

// ── Approvals ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ApproverQuery {
    approver: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl ApproverQuery {
    fn approver(&self) -> Result<&str, ApiError> {
        self.approver
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ApiError::BadRequest("approver is required".into()))
    }
}

pub async fn pending_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApproverQuery>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    let approver = query.approver()?;
    Ok(Json(state.gate.pending_for(approver).await?))
}

pub async fn approval_history(
    State(state): State<AppState>,
    Query(query): Query<ApproverQuery>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    let approver = query.approver()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    Ok(Json(state.gate.history(approver, limit, offset).await?))
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    approval_request_id: Uuid,
    approver_id: String,
    decision: Decision,
    #[serde(default)]
    comments: Option<String>,
}

pub async fn respond(
    State(state): State<AppState>,
    body: Result<Json<RespondRequest>, JsonRejection>,
) -> Result<Json<DecisionReceipt>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if req.approver_id.trim().is_empty() {
        return Err(ApiError::BadRequest("approver_id is required".into()));
    }
    let receipt = state
        .gate
        .submit_decision(
            req.approval_request_id,
            req.approver_id.trim(),
            req.decision,
            req.comments,
        )
        .await?;
    Ok(Json(receipt))
}

// ── Workflows ───────────────────────────────────────────────────────

/// An instance with its derived state, approvals and audit trail.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    instance: WorkflowInstance,
    derived_status: InstanceStatus,
    steps_executed: usize,
    current_step_name: Option<String>,
    approvals: Vec<ApprovalRequest>,
    audit: Vec<AuditEntry>,
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceView>, ApiError> {
    let instance = state
        .db
        .get_instance(id)
        .await?
        .ok_or_else(|| WorkflowError::not_found("workflow_instance", id))?;

    let current_step_name = match instance.current_step_detail_id {
        Some(detail_id) => current_step_name(&state, detail_id).await?,
        None => None,
    };
    let approvals = state.gate.requests_for(id).await?;
    let audit = state.db.list_audit(id).await?;

    Ok(Json(InstanceView {
        derived_status: instance.derived_status(),
        steps_executed: instance.steps_executed(),
        current_step_name,
        approvals,
        audit,
        instance,
    }))
}

async fn current_step_name(state: &AppState, detail_id: Uuid) -> Result<Option<String>, ApiError> {
    let Some(detail) = state.db.get_step_detail(detail_id).await? else {
        return Ok(None);
    };
    Ok(state.db.get_step(detail.step_id).await?.map(|s| s.name))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    status: Option<String>,
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<WorkflowInstance>>, ApiError> {
    let status: InstanceStatus = query
        .status
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("status is required".into()))?
        .parse()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.db.list_instances_by_status(status).await?))
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    requested_by: Option<String>,
}

pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<PassReport>, ApiError> {
    if state.db.get_instance(id).await?.is_none() {
        return Err(WorkflowError::not_found("workflow_instance", id).into());
    }

    info!(instance_id = %id, requested_by = ?query.requested_by, "Manual trigger");
    let report = state
        .dispatcher
        .submit_and_wait(
            id,
            PassTrigger::Manual {
                requested_by: query.requested_by,
            },
        )
        .await?;
    Ok(Json(report))
}

// ── Poller ──────────────────────────────────────────────────────────

pub async fn poller_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.poller.snapshot().await)
}
