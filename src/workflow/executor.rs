//! Step executor gateway.
//!
//! Executors do the actual work of a step (screen a resume, draft an offer).
//! The gateway picks one by step type, bounds it with a timeout and turns
//! every failure into a policy-driven `ExecutionResult`, so the controller
//! always gets an answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::FailurePolicy;
use crate::error::ExecutorError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::rules::mail_is_relevant;
use crate::recruiting::{Candidate, Job, format_email_subject};
use crate::workflow::model::{
    ExecutionResult, PassTrigger, ResolvedStep, StepStatus, StepType,
};

/// Default `data` when an executor reply omits it.
pub const DEFAULT_RESULT_DATA: &str = "Step completed successfully";

/// Everything an executor sees about the step it runs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub step: ResolvedStep,
    pub candidate: Option<Candidate>,
    pub job: Option<Job>,
    pub trigger: PassTrigger,
}

impl ExecutionRequest {
    pub fn step_description(&self) -> &str {
        if self.step.step.description.is_empty() {
            &self.step.step.name
        } else {
            &self.step.step.description
        }
    }

    /// The `{candidate, job, step_detail, trigger_event}` context object.
    pub fn context(&self) -> serde_json::Value {
        json!({
            "candidate": self.candidate,
            "job": self.job,
            "step_detail": self.step.detail,
            "trigger_event": self.trigger,
        })
    }
}

/// Performs the work of one step type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError>;

    /// Whether a trigger warrants running `step` at all.
    fn is_relevant(&self, step: &ResolvedStep, trigger: &PassTrigger) -> bool {
        default_relevance(step, trigger)
    }
}

/// Mail must mention the step's keywords; every other trigger is relevant.
pub fn default_relevance(step: &ResolvedStep, trigger: &PassTrigger) -> bool {
    match trigger {
        PassTrigger::Mail { event } => mail_is_relevant(&step.step.step_type, event),
        PassTrigger::Approval { .. } | PassTrigger::Manual { .. } | PassTrigger::Scheduled { .. } => {
            true
        }
    }
}

/// Executors keyed by step type, with an optional fallback.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<StepType, Arc<dyn StepExecutor>>>,
    fallback: RwLock<Option<Arc<dyn StepExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    pub async fn register(&self, step_type: StepType, executor: Arc<dyn StepExecutor>) {
        debug!(step_type = %step_type, executor = executor.name(), "Registered executor");
        self.executors.write().await.insert(step_type, executor);
    }

    /// Executor for step types without a dedicated one.
    pub async fn set_fallback(&self, executor: Arc<dyn StepExecutor>) {
        debug!(executor = executor.name(), "Registered fallback executor");
        *self.fallback.write().await = Some(executor);
    }

    pub async fn get(&self, step_type: &StepType) -> Option<Arc<dyn StepExecutor>> {
        if let Some(executor) = self.executors.read().await.get(step_type) {
            return Some(Arc::clone(executor));
        }
        self.fallback.read().await.clone()
    }

    pub async fn step_types(&self) -> Vec<StepType> {
        self.executors.read().await.keys().cloned().collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout- and policy-wrapped access to the registry.
pub struct StepGateway {
    registry: Arc<ExecutorRegistry>,
    timeout: Duration,
    policy: FailurePolicy,
}

impl StepGateway {
    pub fn new(registry: Arc<ExecutorRegistry>, timeout: Duration, policy: FailurePolicy) -> Self {
        Self {
            registry,
            timeout,
            policy,
        }
    }

    pub async fn is_relevant(&self, step: &ResolvedStep, trigger: &PassTrigger) -> bool {
        match self.registry.get(&step.step.step_type).await {
            Some(executor) => executor.is_relevant(step, trigger),
            None => default_relevance(step, trigger),
        }
    }

    /// Run a step. Never fails: errors and timeouts map through the failure policy.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let step_type = &request.step.step.step_type;
        let Some(executor) = self.registry.get(step_type).await else {
            let err = ExecutorError::Unsupported(step_type.to_string());
            error!(step = %request.step.name(), error = %err, "No executor for step");
            return self.substitute(self.policy.on_error.clone(), &err);
        };

        match tokio::time::timeout(self.timeout, executor.execute(request)).await {
            Ok(Ok(result)) => {
                info!(
                    step = %request.step.name(),
                    executor = executor.name(),
                    status = %result.status,
                    success = result.success,
                    "Step executed"
                );
                result
            }
            Ok(Err(e)) => {
                error!(
                    step = %request.step.name(),
                    executor = executor.name(),
                    error = %e,
                    "Step executor failed"
                );
                self.substitute(self.policy.on_error.clone(), &e)
            }
            Err(_) => {
                let err = ExecutorError::Timeout(self.timeout);
                warn!(
                    step = %request.step.name(),
                    executor = executor.name(),
                    timeout_secs = self.timeout.as_secs(),
                    "Step executor timed out"
                );
                self.substitute(self.policy.on_timeout.clone(), &err)
            }
        }
    }

    fn substitute(&self, status: StepStatus, err: &ExecutorError) -> ExecutionResult {
        ExecutionResult {
            success: false,
            status,
            data: err.to_string(),
        }
    }
}

/// Approves immediately. Used for informational steps.
pub struct AutoApproveExecutor;

#[async_trait]
impl StepExecutor for AutoApproveExecutor {
    fn name(&self) -> &str {
        "auto_approve"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        Ok(ExecutionResult::approved(format!(
            "Step '{}' acknowledged",
            request.step.name()
        )))
    }
}

/// Runs a step by prompting an LLM and parsing its JSON verdict.
pub struct LlmStepExecutor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmStepExecutor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn system_prompt() -> &'static str {
        "You are a hiring pipeline assistant executing one workflow step. \
         Respond with a single JSON object: \
         {\"success\": bool, \"status\": \"approved\" | \"rejected\" | \"error\", \"data\": string}. \
         Use \"rejected\" only when the candidate clearly fails the step."
    }

    /// Task prompt: step description, type-specific guidance, candidate and job context.
    pub fn task_prompt(request: &ExecutionRequest) -> String {
        let candidate_name = request
            .candidate
            .as_ref()
            .map(Candidate::full_name)
            .unwrap_or_else(|| "Unknown candidate".into());
        let candidate_email = request
            .candidate
            .as_ref()
            .map(|c| c.email.as_str())
            .unwrap_or("");
        let job_title = request
            .job
            .as_ref()
            .map(|j| j.title.as_str())
            .unwrap_or("Unknown Position");
        let short_id = request
            .job
            .as_ref()
            .map(|j| j.short_id.as_str())
            .unwrap_or("JOBXXX");

        let guidance = match &request.step.step.step_type {
            StepType::ResumeAnalysis => format!(
                "Screen the candidate's application against the requirements for {job_title}. \
                 Approve if they meet the core requirements."
            ),
            StepType::TechnicalAssessment => format!(
                "Prepare a technical assessment for the {job_title} position. Subject: {}",
                format_email_subject(&format!("Technical Assessment - {job_title} Position"), short_id)
            ),
            StepType::AssignmentReview => {
                "Review the candidate's assignment submission in the email content below. \
                 Reject only if the submission is missing or clearly inadequate."
                    .to_string()
            }
            StepType::InterviewScheduling => format!(
                "Propose interview times to the candidate. Subject: {}",
                format_email_subject(&format!("Interview Invitation - {job_title} Position"), short_id)
            ),
            StepType::OfferLetter => format!(
                "Draft an offer letter. Subject: {}",
                format_email_subject(
                    &format!("Job Offer - {job_title} Position (Action Required)"),
                    short_id
                )
            ),
            StepType::Informational | StepType::Custom(_) => {
                "Execute the step as described.".to_string()
            }
        };

        let email_content = match request.trigger.mail_event() {
            Some(event) => format!(
                "Subject: {}\nFrom: {}\n\n{}",
                event.subject, event.from, event.body
            ),
            None => "(no email for this step)".to_string(),
        };

        format!(
            "{description}\n\n{guidance}\n\n\
             CANDIDATE INFORMATION:\n- Name: {candidate_name}\n- Email: {candidate_email}\n\
             - Job Applied For: {job_title}\n- Job Short ID: {short_id}\n\n\
             EMAIL CONTENT:\n{email_content}",
            description = request.step_description(),
        )
    }

    /// Parse a model reply. Missing fields default to success, approved and
    /// a generic completion message; a non-JSON reply becomes the `data`.
    pub fn parse_reply(reply: &str) -> ExecutionResult {
        let parsed = match (reply.find('{'), reply.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<serde_json::Value>(&reply[start..=end]).ok()
            }
            _ => None,
        };

        let Some(serde_json::Value::Object(obj)) = parsed else {
            let data = reply.trim();
            return ExecutionResult {
                success: true,
                status: StepStatus::Approved,
                data: if data.is_empty() {
                    DEFAULT_RESULT_DATA.to_string()
                } else {
                    data.to_string()
                },
            };
        };

        let success = obj.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .map(StepStatus::parse_lenient)
            .unwrap_or(StepStatus::Approved);
        let data = match obj.get("data") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => DEFAULT_RESULT_DATA.to_string(),
            Some(other) => other.to_string(),
        };

        ExecutionResult {
            success,
            status,
            data,
        }
    }
}

#[async_trait]
impl StepExecutor for LlmStepExecutor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(Self::system_prompt()),
            ChatMessage::user(Self::task_prompt(request)),
        ])
        .with_max_tokens(1024)
        .with_temperature(0.2);

        let response = self.llm.complete(completion).await?;
        debug!(
            step = %request.step.name(),
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %self.llm.calculate_cost(response.input_tokens, response.output_tokens),
            "LLM step completion"
        );
        Ok(Self::parse_reply(&response.content))
    }
}
