//! `Database` trait: one async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{EventStatus, InboundEvent, StoredEvent};
use crate::recruiting::{Application, Candidate, Job};
use crate::workflow::model::{
    ApprovalDecision, ApprovalRequest, AuditEntry, InstanceStatus, RequestStatus, Step, StepDetail,
    Template, WorkflowInstance,
};

/// Backend-agnostic database trait covering the catalog, recruiting entities,
/// workflow instances, approvals and inbound events.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Catalog ─────────────────────────────────────────────────────

    /// Insert a step. Returns `false` if the id already exists.
    async fn insert_step(&self, step: &Step) -> Result<bool, DatabaseError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError>;

    /// Mark a step deleted. The row is kept.
    async fn soft_delete_step(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Insert a step detail. Returns `false` if the id already exists.
    async fn insert_step_detail(&self, detail: &StepDetail) -> Result<bool, DatabaseError>;

    async fn get_step_detail(&self, id: Uuid) -> Result<Option<StepDetail>, DatabaseError>;

    /// Insert a template. Returns `false` if the id already exists.
    async fn insert_template(&self, template: &Template) -> Result<bool, DatabaseError>;

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, DatabaseError>;

    // ── Jobs, candidates, applications ──────────────────────────────

    /// Insert a job. Returns `false` if the id or short id already exists.
    async fn insert_job(&self, job: &Job) -> Result<bool, DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    async fn get_job_by_short_id(&self, short_id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Jobs that still accept applications (active or draft), oldest first.
    async fn list_open_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Look up a candidate by case-insensitive email within a company.
    async fn find_candidate(
        &self,
        email: &str,
        company_id: Uuid,
    ) -> Result<Option<Candidate>, DatabaseError>;

    async fn get_candidate(&self, id: Uuid) -> Result<Option<Candidate>, DatabaseError>;

    /// Insert unless (email, company) exists; returns the stored row and
    /// whether it was created by this call.
    async fn insert_candidate_if_absent(
        &self,
        candidate: &Candidate,
    ) -> Result<(Candidate, bool), DatabaseError>;

    async fn count_candidates(&self, company_id: Uuid) -> Result<u64, DatabaseError>;

    async fn find_application(
        &self,
        job_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<Application>, DatabaseError>;

    /// Insert unless (job, candidate) exists; returns the stored row and
    /// whether it was created by this call.
    async fn insert_application_if_absent(
        &self,
        application: &Application,
    ) -> Result<(Application, bool), DatabaseError>;

    async fn count_applications(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    // ── Workflow instances ──────────────────────────────────────────

    /// Insert unless (job, candidate, template) exists; returns the stored
    /// row and whether it was created by this call.
    async fn insert_instance_if_absent(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(WorkflowInstance, bool), DatabaseError>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, DatabaseError>;

    async fn find_instance(
        &self,
        job_id: Uuid,
        candidate_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<WorkflowInstance>, DatabaseError>;

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, DatabaseError>;

    /// Write pointer, status, completion time, log and version in one statement,
    /// only if the stored version still equals `expected_version`.
    ///
    /// Returns `false` when the version moved (lost update).
    async fn commit_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    async fn list_audit(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── Approvals ───────────────────────────────────────────────────

    /// Insert unless (instance, step detail, approver) exists.
    /// Returns `true` if this call created the row.
    async fn insert_approval_request_if_absent(
        &self,
        request: &ApprovalRequest,
    ) -> Result<bool, DatabaseError>;

    async fn get_approval_request(&self, id: Uuid)
    -> Result<Option<ApprovalRequest>, DatabaseError>;

    async fn list_approval_requests(
        &self,
        instance_id: Uuid,
        step_detail_id: Option<Uuid>,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    /// Pending requests, optionally for a single approver, oldest first.
    async fn list_pending_approval_requests(
        &self,
        approver_id: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    /// Decided requests for an approver, newest first.
    async fn list_decided_approval_requests(
        &self,
        approver_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError>;

    async fn update_approval_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Insert unless the request already has a decision.
    /// Returns `true` if this call created the row.
    async fn insert_decision_if_absent(
        &self,
        decision: &ApprovalDecision,
    ) -> Result<bool, DatabaseError>;

    async fn get_decision_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ApprovalDecision>, DatabaseError>;

    async fn list_decisions(
        &self,
        instance_id: Uuid,
        step_detail_id: Uuid,
    ) -> Result<Vec<ApprovalDecision>, DatabaseError>;

    // ── Inbound events ──────────────────────────────────────────────

    /// Record an event as pending. Returns `false` if the message id was
    /// already recorded.
    async fn record_inbound_event(
        &self,
        event: &InboundEvent,
        received_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_inbound_event(&self, message_id: &str)
    -> Result<Option<StoredEvent>, DatabaseError>;

    /// Move an event to `processing` if nobody holds it. A `processing`
    /// claim older than `stale_before` is taken over. Returns `false` when
    /// another worker owns the event or it is already finished.
    async fn claim_inbound_event(
        &self,
        message_id: &str,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Failed events, plus pending or processing events untouched since
    /// `idle_before`, oldest first.
    async fn list_unprocessed_inbound_events(
        &self,
        limit: usize,
        idle_before: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DatabaseError>;

    async fn update_inbound_event_status(
        &self,
        message_id: &str,
        status: EventStatus,
        note: Option<&str>,
    ) -> Result<(), DatabaseError>;
}
