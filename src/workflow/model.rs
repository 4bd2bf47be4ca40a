//! Workflow catalog and instance types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::InboundEvent;

/// Longest `data` excerpt kept in an execution log entry.
pub const LOG_EXCERPT_MAX_CHARS: usize = 500;

// ── Catalog ─────────────────────────────────────────────────────────

/// Kind of work a step performs. Selects the executor strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    ResumeAnalysis,
    TechnicalAssessment,
    AssignmentReview,
    InterviewScheduling,
    OfferLetter,
    /// Steps with no work of their own (notices, manual checkpoints).
    Informational,
    Custom(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ResumeAnalysis => "resume_analysis",
            Self::TechnicalAssessment => "technical_assessment",
            Self::AssignmentReview => "assignment_review",
            Self::InterviewScheduling => "interview_scheduling",
            Self::OfferLetter => "offer_letter",
            Self::Informational => "informational",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Guess the step type from a human step name.
    ///
    /// Checked in order: review + technical/assignment, resume/analysis/screening,
    /// technical/assignment/assessment, interview/schedule, offer/letter.
    pub fn from_step_name(name: &str) -> Self {
        let name = name.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

        if has(&["review"]) && has(&["technical", "assignment", "submission"]) {
            Self::AssignmentReview
        } else if has(&["resume", "analysis", "screening"]) {
            Self::ResumeAnalysis
        } else if has(&["technical", "assignment", "assessment"]) {
            Self::TechnicalAssessment
        } else if has(&["interview", "schedule"]) {
            Self::InterviewScheduling
        } else if has(&["offer", "letter"]) {
            Self::OfferLetter
        } else {
            Self::Informational
        }
    }
}

impl From<String> for StepType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "resume_analysis" => Self::ResumeAnalysis,
            "technical_assessment" => Self::TechnicalAssessment,
            "assignment_review" => Self::AssignmentReview,
            "interview_scheduling" => Self::InterviewScheduling,
            "offer_letter" => Self::OfferLetter,
            "informational" => Self::Informational,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for StepType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<StepType> for String {
    fn from(t: StepType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry for a unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub step_type: StepType,
    /// Free-form action specs handed to the executor.
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(name: impl Into<String>, description: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            step_type,
            actions: Vec::new(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A step's scheduling and gating configuration inside one template.
///
/// Holds no execution status: that lives on the workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDetail {
    pub id: Uuid,
    pub template_id: Uuid,
    pub step_id: Uuid,
    /// 1-based position within the template.
    pub order_number: u32,
    pub auto_start: bool,
    pub required_human_approval: bool,
    /// Quorum; `None` means every approver.
    pub number_of_approvals_needed: Option<u32>,
    pub approvers: Vec<String>,
    pub delay_in_seconds: u64,
}

impl StepDetail {
    pub fn new(template_id: Uuid, step_id: Uuid, order_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id,
            step_id,
            order_number,
            auto_start: false,
            required_human_approval: false,
            number_of_approvals_needed: None,
            approvers: Vec::new(),
            delay_in_seconds: 0,
        }
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_approvers(mut self, approvers: &[&str], needed: Option<u32>) -> Self {
        self.required_human_approval = true;
        self.approvers = distinct_approvers(approvers.iter().copied());
        self.number_of_approvals_needed = needed;
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay_in_seconds = seconds;
        self
    }

    /// Whether entering this step blocks on human sign-off.
    pub fn is_gated(&self) -> bool {
        self.required_human_approval && !self.approvers.is_empty()
    }

    /// Approved decisions needed to pass, clamped to `1..=approvers.len()`.
    pub fn quorum(&self) -> usize {
        let total = self.approvers.len().max(1);
        let needed = self
            .number_of_approvals_needed
            .map(|n| n as usize)
            .unwrap_or(total);
        needed.clamp(1, total)
    }
}

/// Approver ids with repeats removed, first occurrence kept.
///
/// Each approver gets one request per step, so a repeated id would inflate
/// the quorum past what can ever be reached.
pub fn distinct_approvers<I, S>(approvers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    approvers
        .into_iter()
        .map(Into::into)
        .filter(|a: &String| seen.insert(a.clone()))
        .collect()
}

/// Named, ordered pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub step_detail_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(name: impl Into<String>, step_detail_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            step_detail_ids,
            created_at: Utc::now(),
        }
    }
}

/// A step detail joined with its catalog step.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedStep {
    pub detail: StepDetail,
    pub step: Step,
}

impl ResolvedStep {
    pub fn detail_id(&self) -> Uuid {
        self.detail.id
    }

    pub fn order_number(&self) -> u32 {
        self.detail.order_number
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }
}

// ── Instances ───────────────────────────────────────────────────────

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Progressing, or ready for the next trigger.
    Running,
    /// Blocked on approval requests for the current step.
    AwaitingApproval,
    /// Parked until a manual trigger (auto_start off, executor error, bad catalog).
    Paused,
    Completed,
    Rejected,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown instance status: {s}")),
        }
    }
}

/// Outcome reported by a step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Approved,
    Rejected,
    /// Anything else. Parks the instance.
    Error,
}

impl StepStatus {
    /// Parse an executor-reported status; unknown values count as `Error`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" | "completed" | "success" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of running one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: StepStatus,
    pub data: String,
}

impl ExecutionResult {
    pub fn approved(data: impl Into<String>) -> Self {
        Self {
            success: true,
            status: StepStatus::Approved,
            data: data.into(),
        }
    }

    pub fn rejected(data: impl Into<String>) -> Self {
        Self {
            success: true,
            status: StepStatus::Rejected,
            data: data.into(),
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self {
            success: false,
            status: StepStatus::Error,
            data: data.into(),
        }
    }
}

/// Marker status written when an approval gate vetoes a step.
pub const GATE_REJECTED_STATUS: &str = "gate_rejected";

/// One entry of an instance's append-only execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub step_detail_id: Uuid,
    pub status: String,
    pub success: bool,
    pub data_excerpt: String,
}

impl LogEntry {
    pub fn executed(step_detail_id: Uuid, result: &ExecutionResult) -> Self {
        Self {
            timestamp: Utc::now(),
            step_detail_id,
            status: result.status.as_str().to_string(),
            success: result.success,
            data_excerpt: excerpt(&result.data),
        }
    }

    pub fn gate_rejected(step_detail_id: Uuid, rejections: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            step_detail_id,
            status: GATE_REJECTED_STATUS.to_string(),
            success: false,
            data_excerpt: format!("Approval gate rejected by {rejections} approver(s)"),
        }
    }

    /// Whether this entry marks the instance as rejected.
    pub fn is_rejection(&self) -> bool {
        self.status == GATE_REJECTED_STATUS || self.status == StepStatus::Rejected.as_str()
    }
}

/// Truncate on a char boundary to the log excerpt limit.
pub fn excerpt(data: &str) -> String {
    if data.chars().count() <= LOG_EXCERPT_MAX_CHARS {
        return data.to_string();
    }
    let cut: String = data.chars().take(LOG_EXCERPT_MAX_CHARS).collect();
    format!("{cut}...")
}

/// A template execution for one (job, candidate) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub job_id: Uuid,
    pub candidate_id: Uuid,
    pub template_id: Uuid,
    /// `None` once the instance is terminal.
    pub current_step_detail_id: Option<Uuid>,
    pub status: InstanceStatus,
    /// Bumped on every committed transition.
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_log: Vec<LogEntry>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A fresh instance seeded at `first_step`.
    pub fn new(job_id: Uuid, candidate_id: Uuid, template_id: Uuid, first_step: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            candidate_id,
            template_id,
            current_step_detail_id: Some(first_step),
            status: InstanceStatus::Running,
            version: 0,
            started_at: now,
            completed_at: None,
            execution_log: Vec::new(),
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_step_detail_id.is_none()
    }

    /// State derived from the pointer and log rather than the stored status.
    pub fn derived_status(&self) -> InstanceStatus {
        if self.current_step_detail_id.is_some() {
            return self.status;
        }
        if self.execution_log.iter().any(LogEntry::is_rejection) {
            InstanceStatus::Rejected
        } else {
            InstanceStatus::Completed
        }
    }

    /// Number of log entries produced by actually running a step.
    pub fn steps_executed(&self) -> usize {
        self.execution_log
            .iter()
            .filter(|e| e.status != GATE_REJECTED_STATUS)
            .count()
    }
}

/// What caused a progression pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassTrigger {
    /// An inbound candidate email matched to this instance.
    Mail { event: InboundEvent },
    /// A decisive approval outcome landed for `step_detail_id`.
    Approval { step_detail_id: Uuid },
    /// Operator re-trigger.
    Manual { requested_by: Option<String> },
    /// A delayed step came due.
    Scheduled { step_detail_id: Uuid },
}

impl PassTrigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mail { .. } => "mail",
            Self::Approval { .. } => "approval",
            Self::Manual { .. } => "manual",
            Self::Scheduled { .. } => "scheduled",
        }
    }

    /// Step this trigger was issued for, if it targets a specific one.
    pub fn target_step(&self) -> Option<Uuid> {
        match self {
            Self::Approval { step_detail_id } | Self::Scheduled { step_detail_id } => {
                Some(*step_detail_id)
            }
            Self::Mail { .. } | Self::Manual { .. } => None,
        }
    }

    pub fn mail_event(&self) -> Option<&InboundEvent> {
        match self {
            Self::Mail { event } => Some(event),
            _ => None,
        }
    }
}

/// Instance-level audit record outside the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instance_id: Uuid,
    pub event: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

// ── Approvals ───────────────────────────────────────────────────────

/// Result of evaluating an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    NoApprovalNeeded,
    Awaiting,
    Approved,
    Rejected,
}

impl GateOutcome {
    /// Approved or rejected: no further decisions can change progression.
    pub fn is_decisive(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

/// An approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown decision: {s}")),
        }
    }
}

/// Status mirrored onto an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl From<Decision> for RequestStatus {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Approved => Self::Approved,
            Decision::Rejected => Self::Rejected,
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown request status: {s}")),
        }
    }
}

/// One approver's request to sign off a step of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_detail_id: Uuid,
    pub approver_id: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(instance_id: Uuid, step_detail_id: Uuid, approver_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            step_detail_id,
            approver_id: approver_id.to_string(),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Immutable verdict recorded against one approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: Uuid,
    pub request_id: Uuid,
    pub instance_id: Uuid,
    pub step_detail_id: Uuid,
    pub approver_id: String,
    pub decision: Decision,
    pub comments: Option<String>,
    pub decided_at: DateTime<Utc>,
}
