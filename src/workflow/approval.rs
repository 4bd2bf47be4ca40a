//! Quorum-based human approval gate.
//!
//! Entering a gated step fans out one request per approver. The gate passes
//! once enough approvers say yes and nobody has said no; a single rejection
//! vetoes the step regardless of quorum.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::notify::{ApprovalNotification, Notifier};
use crate::error::WorkflowError;
use crate::store::Database;
use crate::workflow::dispatcher::PassDispatcher;
use crate::workflow::model::{
    ApprovalDecision, ApprovalRequest, Decision, GateOutcome, PassTrigger, RequestStatus,
    ResolvedStep, StepDetail, WorkflowInstance,
};

/// Decision counts for one (instance, step).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateTally {
    pub approved: usize,
    pub rejected: usize,
}

impl GateTally {
    fn outcome(&self, quorum: usize) -> GateOutcome {
        if self.rejected > 0 {
            GateOutcome::Rejected
        } else if self.approved >= quorum {
            GateOutcome::Approved
        } else {
            GateOutcome::Awaiting
        }
    }
}

/// Returned to the approver after a decision is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionReceipt {
    pub decision: ApprovalDecision,
    pub outcome: GateOutcome,
    pub pass_enqueued: bool,
}

pub struct ApprovalGate {
    db: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    dispatcher: PassDispatcher,
}

impl ApprovalGate {
    pub fn new(db: Arc<dyn Database>, notifier: Arc<dyn Notifier>, dispatcher: PassDispatcher) -> Self {
        Self {
            db,
            notifier,
            dispatcher,
        }
    }

    /// Evaluate the gate of `step` for `instance`, fanning out requests the
    /// first time a gated step is reached.
    pub async fn check(
        &self,
        step: &ResolvedStep,
        instance: &WorkflowInstance,
    ) -> Result<GateOutcome, WorkflowError> {
        let detail = &step.detail;
        if !detail.required_human_approval {
            return Ok(GateOutcome::NoApprovalNeeded);
        }
        if detail.approvers.is_empty() {
            warn!(
                instance_id = %instance.id,
                step_detail_id = %detail.id,
                "Step requires approval but has no approvers; treating as ungated"
            );
            return Ok(GateOutcome::NoApprovalNeeded);
        }

        let existing = self
            .db
            .list_approval_requests(instance.id, Some(detail.id))
            .await?;
        if existing.len() < detail.approvers.len() {
            self.fan_out(step, instance).await?;
        }

        let tally = self.tally(instance.id, detail.id).await?;
        let outcome = tally.outcome(detail.quorum());
        debug!(
            instance_id = %instance.id,
            step_detail_id = %detail.id,
            approved = tally.approved,
            rejected = tally.rejected,
            quorum = detail.quorum(),
            outcome = ?outcome,
            "Gate evaluated"
        );
        Ok(outcome)
    }

    /// Count recorded decisions for one step of one instance.
    pub async fn tally(
        &self,
        instance_id: Uuid,
        step_detail_id: Uuid,
    ) -> Result<GateTally, WorkflowError> {
        let decisions = self.db.list_decisions(instance_id, step_detail_id).await?;
        Ok(decisions
            .iter()
            .fold(GateTally::default(), |mut t, d| {
                match d.decision {
                    Decision::Approved => t.approved += 1,
                    Decision::Rejected => t.rejected += 1,
                }
                t
            }))
    }

    /// Create one request per approver; only newly created ones are notified.
    async fn fan_out(
        &self,
        step: &ResolvedStep,
        instance: &WorkflowInstance,
    ) -> Result<(), WorkflowError> {
        let candidate_name = self
            .db
            .get_candidate(instance.candidate_id)
            .await?
            .map(|c| c.full_name());
        let job_title = self.db.get_job(instance.job_id).await?.map(|j| j.title);

        for approver in &step.detail.approvers {
            let request = ApprovalRequest::new(instance.id, step.detail.id, approver);
            if !self.db.insert_approval_request_if_absent(&request).await? {
                continue;
            }
            info!(
                instance_id = %instance.id,
                request_id = %request.id,
                approver = %approver,
                step = %step.name(),
                "Approval requested"
            );

            let notification = ApprovalNotification {
                request_id: request.id,
                instance_id: instance.id,
                step_detail_id: step.detail.id,
                step_name: step.name().to_string(),
                approver_id: approver.clone(),
                candidate_name: candidate_name.clone(),
                job_title: job_title.clone(),
                created_at: request.created_at,
            };
            if let Err(e) = self.notifier.notify(&notification).await {
                warn!(request_id = %request.id, error = %e, "Approver notification failed");
            }
        }
        Ok(())
    }

    /// Record an approver's verdict and, when it settles the gate, enqueue a
    /// progression pass for the instance.
    pub async fn submit_decision(
        &self,
        request_id: Uuid,
        approver_id: &str,
        decision: Decision,
        comments: Option<String>,
    ) -> Result<DecisionReceipt, WorkflowError> {
        let request = self
            .db
            .get_approval_request(request_id)
            .await?
            .filter(|r| r.approver_id == approver_id)
            .ok_or_else(|| WorkflowError::not_found("approval_request", request_id))?;

        if self.db.get_decision_for_request(request_id).await?.is_some() {
            return Err(WorkflowError::DuplicateDecision { request_id });
        }
        if request.status != RequestStatus::Pending {
            return Err(WorkflowError::not_found("approval_request", request_id));
        }

        let record = ApprovalDecision {
            id: Uuid::new_v4(),
            request_id,
            instance_id: request.instance_id,
            step_detail_id: request.step_detail_id,
            approver_id: approver_id.to_string(),
            decision,
            comments,
            decided_at: Utc::now(),
        };
        if !self.db.insert_decision_if_absent(&record).await? {
            return Err(WorkflowError::DuplicateDecision { request_id });
        }
        self.db
            .update_approval_request_status(request_id, decision.into(), Some(record.decided_at))
            .await?;

        info!(
            instance_id = %request.instance_id,
            request_id = %request_id,
            approver = %approver_id,
            decision = decision.as_str(),
            "Approval decision recorded"
        );

        let outcome = match self.db.get_step_detail(request.step_detail_id).await? {
            Some(detail) => self.outcome_for(&detail, request.instance_id).await?,
            None => {
                warn!(step_detail_id = %request.step_detail_id, "Decision for unknown step detail");
                GateOutcome::Awaiting
            }
        };

        let mut pass_enqueued = false;
        if outcome.is_decisive() {
            let trigger = PassTrigger::Approval {
                step_detail_id: request.step_detail_id,
            };
            match self.dispatcher.submit(request.instance_id, trigger) {
                Ok(()) => pass_enqueued = true,
                Err(e) => warn!(instance_id = %request.instance_id, error = %e, "Could not enqueue pass"),
            }
        }

        Ok(DecisionReceipt {
            decision: record,
            outcome,
            pass_enqueued,
        })
    }

    async fn outcome_for(
        &self,
        detail: &StepDetail,
        instance_id: Uuid,
    ) -> Result<GateOutcome, WorkflowError> {
        let tally = self.tally(instance_id, detail.id).await?;
        Ok(tally.outcome(detail.quorum()))
    }

    /// Pending requests for one approver, oldest first.
    pub async fn pending_for(&self, approver_id: &str) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        Ok(self.db.list_pending_approval_requests(Some(approver_id)).await?)
    }

    /// Decided requests for one approver, newest first.
    pub async fn history(
        &self,
        approver_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        Ok(self
            .db
            .list_decided_approval_requests(approver_id, limit, offset)
            .await?)
    }

    pub async fn requests_for(&self, instance_id: Uuid) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        Ok(self.db.list_approval_requests(instance_id, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::channels::notify::BroadcastNotifier;
    use crate::store::LibSqlBackend;
    use crate::workflow::controller::{PassOutcome, PassReport};
    use crate::workflow::dispatcher::{PassRunner, dispatch_channel};
    use crate::workflow::model::{InstanceStatus, Step, StepType};

    /// Records the passes the gate enqueues instead of running them.
    #[derive(Default)]
    struct Recorder {
        passes: Mutex<Vec<(Uuid, PassTrigger)>>,
    }

    #[async_trait]
    impl PassRunner for Recorder {
        async fn run_pass(
            &self,
            instance_id: Uuid,
            trigger: PassTrigger,
        ) -> Result<PassReport, WorkflowError> {
            self.passes.lock().await.push((instance_id, trigger.clone()));
            Ok(PassReport {
                instance_id,
                trigger: trigger.kind(),
                outcome: PassOutcome::Terminal,
                steps_executed: 0,
                status: InstanceStatus::Running,
                current_step_detail_id: None,
            })
        }
    }

    struct Fixture {
        gate: ApprovalGate,
        recorder: Arc<Recorder>,
        notifications: tokio::sync::broadcast::Receiver<ApprovalNotification>,
        step: ResolvedStep,
        instance: WorkflowInstance,
    }

    async fn fixture(approvers: &[&str], needed: Option<u32>) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let notifications = notifier.subscribe();
        let recorder = Arc::new(Recorder::default());
        let (dispatcher, queue) = dispatch_channel();
        queue.start(recorder.clone(), 4);

        let step = Step::new("Offer Approval", "", StepType::OfferLetter);
        let detail = StepDetail::new(Uuid::new_v4(), step.id, 1).with_approvers(approvers, needed);
        let instance =
            WorkflowInstance::new(Uuid::new_v4(), Uuid::new_v4(), detail.template_id, detail.id);
        db.insert_step(&step).await.unwrap();
        db.insert_step_detail(&detail).await.unwrap();
        db.insert_instance_if_absent(&instance).await.unwrap();

        Fixture {
            gate: ApprovalGate::new(db, notifier, dispatcher),
            recorder,
            notifications,
            step: ResolvedStep { detail, step },
            instance,
        }
    }

    async fn request_for(f: &Fixture, approver: &str) -> Uuid {
        f.gate
            .requests_for(f.instance.id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.approver_id == approver)
            .unwrap()
            .id
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn ungated_step_needs_no_approval() {
        let mut f = fixture(&["alice"], None).await;
        f.step.detail.required_human_approval = false;
        let outcome = f.gate.check(&f.step, &f.instance).await.unwrap();
        assert_eq!(outcome, GateOutcome::NoApprovalNeeded);
        assert!(f.gate.requests_for(f.instance.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_approvers_is_not_gated() {
        let mut f = fixture(&["alice"], None).await;
        f.step.detail.approvers.clear();
        let outcome = f.gate.check(&f.step, &f.instance).await.unwrap();
        assert_eq!(outcome, GateOutcome::NoApprovalNeeded);
    }

    #[tokio::test]
    async fn fan_out_once_and_notify_each_approver() {
        let mut f = fixture(&["alice", "bob"], None).await;
        assert_eq!(
            f.gate.check(&f.step, &f.instance).await.unwrap(),
            GateOutcome::Awaiting
        );
        assert_eq!(
            f.gate.check(&f.step, &f.instance).await.unwrap(),
            GateOutcome::Awaiting
        );
        assert_eq!(f.gate.requests_for(f.instance.id).await.unwrap().len(), 2);

        let mut notified = vec![
            f.notifications.try_recv().unwrap().approver_id,
            f.notifications.try_recv().unwrap().approver_id,
        ];
        notified.sort();
        assert_eq!(notified, vec!["alice", "bob"]);
        assert!(f.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn quorum_two_of_three() {
        let f = fixture(&["a", "b", "c"], Some(2)).await;
        f.gate.check(&f.step, &f.instance).await.unwrap();

        let first = request_for(&f, "a").await;
        let receipt = f
            .gate
            .submit_decision(first, "a", Decision::Approved, None)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, GateOutcome::Awaiting);
        assert!(!receipt.pass_enqueued);

        let second = request_for(&f, "c").await;
        let receipt = f
            .gate
            .submit_decision(second, "c", Decision::Approved, Some("yes".into()))
            .await
            .unwrap();
        assert_eq!(receipt.outcome, GateOutcome::Approved);
        assert!(receipt.pass_enqueued);

        settle().await;
        let passes = f.recorder.passes.lock().await;
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].0, f.instance.id);
        assert!(matches!(
            passes[0].1,
            PassTrigger::Approval { step_detail_id } if step_detail_id == f.step.detail.id
        ));
    }

    #[tokio::test]
    async fn single_rejection_vetoes_with_pending_decisions() {
        let f = fixture(&["a", "b", "c"], Some(1)).await;
        f.gate.check(&f.step, &f.instance).await.unwrap();

        let b = request_for(&f, "b").await;
        let receipt = f
            .gate
            .submit_decision(b, "b", Decision::Rejected, Some("no".into()))
            .await
            .unwrap();
        assert_eq!(receipt.outcome, GateOutcome::Rejected);
        assert_eq!(
            f.gate.check(&f.step, &f.instance).await.unwrap(),
            GateOutcome::Rejected
        );
        assert_eq!(
            f.gate.tally(f.instance.id, f.step.detail.id).await.unwrap(),
            GateTally {
                approved: 0,
                rejected: 1
            }
        );
    }

    #[tokio::test]
    async fn duplicate_and_foreign_decisions_are_refused() {
        let f = fixture(&["alice", "bob"], None).await;
        f.gate.check(&f.step, &f.instance).await.unwrap();
        let alice = request_for(&f, "alice").await;

        let err = f
            .gate
            .submit_decision(alice, "bob", Decision::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));

        f.gate
            .submit_decision(alice, "alice", Decision::Approved, None)
            .await
            .unwrap();
        let err = f
            .gate
            .submit_decision(alice, "alice", Decision::Rejected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateDecision { .. }));

        let err = f
            .gate
            .submit_decision(Uuid::new_v4(), "alice", Decision::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn listings_follow_decisions() {
        let f = fixture(&["alice", "bob"], None).await;
        f.gate.check(&f.step, &f.instance).await.unwrap();
        assert_eq!(f.gate.pending_for("alice").await.unwrap().len(), 1);

        let alice = request_for(&f, "alice").await;
        f.gate
            .submit_decision(alice, "alice", Decision::Approved, None)
            .await
            .unwrap();
        assert!(f.gate.pending_for("alice").await.unwrap().is_empty());
        let history = f.gate.history("alice", 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RequestStatus::Approved);
        assert_eq!(f.gate.pending_for("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_approver_gets_one_request_and_passes_alone() {
        let f = fixture(&["alice", "alice"], None).await;
        assert_eq!(f.step.detail.quorum(), 1);
        f.gate.check(&f.step, &f.instance).await.unwrap();
        assert_eq!(f.gate.requests_for(f.instance.id).await.unwrap().len(), 1);

        let alice = request_for(&f, "alice").await;
        let receipt = f
            .gate
            .submit_decision(alice, "alice", Decision::Approved, None)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, GateOutcome::Approved);
    }
}
