//! Progression controller: advances one workflow instance per pass.
//!
//! A pass runs at most `max_steps_per_pass` iterations. Each iteration
//! resolves the current step, consults its approval gate, executes it and
//! commits the resulting transition with a single version-guarded write.
//! A lost update aborts the pass and the whole pass is retried against
//! fresh state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::store::Database;
use crate::workflow::approval::ApprovalGate;
use crate::workflow::catalog::WorkflowCatalog;
use crate::workflow::dispatcher::PassRunner;
use crate::workflow::executor::{ExecutionRequest, StepGateway};
use crate::workflow::model::{
    AuditEntry, GateOutcome, InstanceStatus, LogEntry, PassTrigger, ResolvedStep, StepStatus,
    WorkflowInstance,
};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Nothing to do: the instance already finished.
    Terminal,
    /// Blocked on approval requests for the current step.
    Awaiting,
    Completed,
    Rejected,
    /// The trigger did not concern the current step.
    NotRelevant,
    /// The executor reported an error; the pointer stays put.
    Parked,
    /// The next step does not auto-start.
    Paused,
    /// The next step is due after a delay.
    Deferred { step_detail_id: Uuid, delay_secs: u64 },
    /// An approval or scheduled trigger for a step the instance already left.
    Stale,
    /// `max_steps_per_pass` iterations ran without reaching a stop.
    IterationLimit,
    /// The catalog could not resolve a step; the instance is parked.
    ConfigurationSkipped,
}

/// Summary of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub instance_id: Uuid,
    pub trigger: &'static str,
    pub outcome: PassOutcome,
    pub steps_executed: usize,
    pub status: InstanceStatus,
    pub current_step_detail_id: Option<Uuid>,
}

pub struct ProgressionController {
    db: Arc<dyn Database>,
    catalog: Arc<WorkflowCatalog>,
    gate: Arc<ApprovalGate>,
    gateway: Arc<StepGateway>,
    config: EngineConfig,
}

impl ProgressionController {
    pub fn new(
        db: Arc<dyn Database>,
        catalog: Arc<WorkflowCatalog>,
        gate: Arc<ApprovalGate>,
        gateway: Arc<StepGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            catalog,
            gate,
            gateway,
            config,
        }
    }

    /// Run one pass, retrying from fresh state on version conflicts.
    pub async fn run_pass(
        &self,
        instance_id: Uuid,
        trigger: PassTrigger,
    ) -> Result<PassReport, WorkflowError> {
        let mut attempt = 0u32;
        loop {
            match self.pass_once(instance_id, &trigger).await {
                Err(WorkflowError::ConcurrencyConflict { .. })
                    if attempt < self.config.conflict_retries =>
                {
                    attempt += 1;
                    warn!(instance_id = %instance_id, attempt, "Version conflict, retrying pass");
                }
                other => return other,
            }
        }
    }

    async fn pass_once(
        &self,
        instance_id: Uuid,
        trigger: &PassTrigger,
    ) -> Result<PassReport, WorkflowError> {
        let mut instance = self
            .db
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("workflow_instance", instance_id))?;
        let candidate = self.db.get_candidate(instance.candidate_id).await?;
        let job = self.db.get_job(instance.job_id).await?;

        debug!(
            instance_id = %instance_id,
            trigger = trigger.kind(),
            status = %instance.status,
            "Pass started"
        );

        let mut executed = 0usize;
        for iteration in 1..=self.config.max_steps_per_pass {
            let Some(current_id) = instance.current_step_detail_id else {
                return Ok(self.report(&instance, trigger, PassOutcome::Terminal, executed));
            };

            let step = match self.catalog.resolve_step(current_id).await {
                Ok(step) => step,
                Err(WorkflowError::Configuration(reason)) => {
                    error!(instance_id = %instance_id, step_detail_id = %current_id, %reason,
                        "Catalog error, parking instance");
                    self.park_for_configuration(&mut instance, &reason).await?;
                    return Ok(self.report(
                        &instance,
                        trigger,
                        PassOutcome::ConfigurationSkipped,
                        executed,
                    ));
                }
                Err(e) => return Err(e),
            };

            if iteration == 1
                && let Some(target) = trigger.target_step()
                && target != current_id
            {
                debug!(instance_id = %instance_id, %target, current = %current_id, "Stale trigger");
                return Ok(self.report(&instance, trigger, PassOutcome::Stale, executed));
            }

            match self.gate.check(&step, &instance).await? {
                GateOutcome::Awaiting => {
                    if instance.status != InstanceStatus::AwaitingApproval {
                        instance.status = InstanceStatus::AwaitingApproval;
                        self.commit(&mut instance).await?;
                    }
                    return Ok(self.report(&instance, trigger, PassOutcome::Awaiting, executed));
                }
                GateOutcome::Rejected => {
                    let tally = self.gate.tally(instance.id, current_id).await?;
                    instance
                        .execution_log
                        .push(LogEntry::gate_rejected(current_id, tally.rejected));
                    self.finish(&mut instance, InstanceStatus::Rejected).await?;
                    info!(instance_id = %instance_id, step = %step.name(), "Rejected at approval gate");
                    self.audit(instance_id, "rejected", Some(format!("gate: {}", step.name())))
                        .await;
                    return Ok(self.report(&instance, trigger, PassOutcome::Rejected, executed));
                }
                GateOutcome::NoApprovalNeeded | GateOutcome::Approved => {}
            }

            if iteration == 1 && !self.gateway.is_relevant(&step, trigger).await {
                debug!(instance_id = %instance_id, step = %step.name(), "Trigger not relevant");
                return Ok(self.report(&instance, trigger, PassOutcome::NotRelevant, executed));
            }

            let request = ExecutionRequest {
                step: step.clone(),
                candidate: candidate.clone(),
                job: job.clone(),
                trigger: trigger.clone(),
            };
            let result = self.gateway.execute(&request).await;
            instance
                .execution_log
                .push(LogEntry::executed(current_id, &result));
            executed += 1;

            match result.status {
                StepStatus::Approved => match self.advance(&mut instance, &step).await? {
                    Some(outcome) => {
                        return Ok(self.report(&instance, trigger, outcome, executed));
                    }
                    None => continue,
                },
                StepStatus::Rejected => {
                    self.finish(&mut instance, InstanceStatus::Rejected).await?;
                    info!(instance_id = %instance_id, step = %step.name(), "Rejected by step");
                    self.audit(instance_id, "rejected", Some(format!("step: {}", step.name())))
                        .await;
                    return Ok(self.report(&instance, trigger, PassOutcome::Rejected, executed));
                }
                StepStatus::Error => {
                    instance.status = InstanceStatus::Paused;
                    self.commit(&mut instance).await?;
                    warn!(instance_id = %instance_id, step = %step.name(), "Step errored, instance parked");
                    self.audit(instance_id, "parked", Some(result.data.clone())).await;
                    return Ok(self.report(&instance, trigger, PassOutcome::Parked, executed));
                }
            }
        }

        warn!(
            instance_id = %instance_id,
            limit = self.config.max_steps_per_pass,
            "Pass hit iteration limit"
        );
        Ok(self.report(&instance, trigger, PassOutcome::IterationLimit, executed))
    }

    /// Move past an approved step. Returns `None` when the pass should keep going.
    ///
    /// Template entries whose step cannot be resolved are passed over and
    /// audited once the move is committed.
    async fn advance(
        &self,
        instance: &mut WorkflowInstance,
        step: &ResolvedStep,
    ) -> Result<Option<PassOutcome>, WorkflowError> {
        let lookup = match self
            .catalog
            .next_step(instance.template_id, step.order_number())
            .await
        {
            Ok(lookup) => lookup,
            Err(WorkflowError::Configuration(reason)) => {
                error!(instance_id = %instance.id, %reason, "Cannot resolve next step, parking instance");
                self.park_for_configuration(instance, &reason).await?;
                return Ok(Some(PassOutcome::ConfigurationSkipped));
            }
            Err(e) => return Err(e),
        };

        let outcome = self.move_to(instance, lookup.step).await?;
        for skipped in &lookup.skipped {
            warn!(
                instance_id = %instance.id,
                step_detail_id = %skipped.step_detail_id,
                order = ?skipped.order_number,
                reason = %skipped.reason,
                "Skipped unresolvable step"
            );
            self.audit(instance.id, "step_skipped", Some(skipped.reason.clone()))
                .await;
        }
        Ok(outcome)
    }

    async fn move_to(
        &self,
        instance: &mut WorkflowInstance,
        next: Option<ResolvedStep>,
    ) -> Result<Option<PassOutcome>, WorkflowError> {
        let Some(next) = next else {
            self.finish(instance, InstanceStatus::Completed).await?;
            info!(instance_id = %instance.id, "Workflow completed");
            self.audit(instance.id, "completed", None).await;
            return Ok(Some(PassOutcome::Completed));
        };

        instance.current_step_detail_id = Some(next.detail_id());

        if next.detail.is_gated() {
            instance.status = InstanceStatus::AwaitingApproval;
            self.commit(instance).await?;
            info!(instance_id = %instance.id, step = %next.name(), "Advanced to gated step");
            // Fan out now so approvers hear about it without another trigger.
            self.gate.check(&next, instance).await?;
            return Ok(Some(PassOutcome::Awaiting));
        }

        if !next.detail.auto_start {
            instance.status = InstanceStatus::Paused;
            self.commit(instance).await?;
            info!(instance_id = %instance.id, step = %next.name(), "Next step waits for a trigger");
            return Ok(Some(PassOutcome::Paused));
        }

        instance.status = InstanceStatus::Running;
        self.commit(instance).await?;

        if next.detail.delay_in_seconds > 0 {
            return Ok(Some(PassOutcome::Deferred {
                step_detail_id: next.detail_id(),
                delay_secs: next.detail.delay_in_seconds,
            }));
        }
        Ok(None)
    }

    async fn finish(
        &self,
        instance: &mut WorkflowInstance,
        status: InstanceStatus,
    ) -> Result<(), WorkflowError> {
        instance.current_step_detail_id = None;
        instance.status = status;
        instance.completed_at = Some(Utc::now());
        self.commit(instance).await
    }

    /// Pause the instance. Always commits so a log entry appended earlier in
    /// the pass is kept.
    async fn park_for_configuration(
        &self,
        instance: &mut WorkflowInstance,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        instance.status = InstanceStatus::Paused;
        self.commit(instance).await?;
        self.audit(instance.id, "configuration_error", Some(reason.to_string()))
            .await;
        Ok(())
    }

    /// Version-guarded write of the whole transition.
    async fn commit(&self, instance: &mut WorkflowInstance) -> Result<(), WorkflowError> {
        let expected = instance.version;
        if !self.db.commit_instance(instance, expected).await? {
            return Err(WorkflowError::ConcurrencyConflict {
                instance_id: instance.id,
            });
        }
        instance.version = expected + 1;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn audit(&self, instance_id: Uuid, event: &str, detail: Option<String>) {
        let entry = AuditEntry {
            instance_id,
            event: event.to_string(),
            detail,
            at: Utc::now(),
        };
        if let Err(e) = self.db.append_audit(&entry).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to write audit entry");
        }
    }

    fn report(
        &self,
        instance: &WorkflowInstance,
        trigger: &PassTrigger,
        outcome: PassOutcome,
        steps_executed: usize,
    ) -> PassReport {
        debug!(
            instance_id = %instance.id,
            outcome = ?outcome,
            steps_executed,
            "Pass finished"
        );
        PassReport {
            instance_id: instance.id,
            trigger: trigger.kind(),
            outcome,
            steps_executed,
            status: instance.status,
            current_step_detail_id: instance.current_step_detail_id,
        }
    }
}

#[async_trait]
impl PassRunner for ProgressionController {
    async fn run_pass(
        &self,
        instance_id: Uuid,
        trigger: PassTrigger,
    ) -> Result<PassReport, WorkflowError> {
        ProgressionController::run_pass(self, instance_id, trigger).await
    }
}
