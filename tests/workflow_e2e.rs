//! End-to-end progression scenarios against an in-memory engine.

mod common;

use std::time::Duration;

use hire_flow::config::EngineConfig;
use hire_flow::pipeline::{InboundEvent, IngestOutcome};
use hire_flow::workflow::PassOutcome;
use hire_flow::workflow::model::{
    Decision, ExecutionResult, GateOutcome, InstanceStatus, PassTrigger, RequestStatus,
};

use common::{Script, StepSpec, engine, engine_with, instance, job, template, wait_for_status};

fn application(subject: &str, message_id: &str) -> InboundEvent {
    InboundEvent::new(
        "Jane Smith <jane@example.com>",
        subject,
        "Please find my resume attached.",
        message_id,
    )
}

fn manual() -> PassTrigger {
    PassTrigger::Manual { requested_by: None }
}

fn captured_instance(outcome: IngestOutcome) -> uuid::Uuid {
    match outcome {
        IngestOutcome::Captured {
            instance: Some(instance),
            ..
        } => instance.id,
        other => panic!("expected a captured instance, got {}", other.label()),
    }
}

#[tokio::test]
async fn application_mail_completes_two_step_pipeline() {
    let e = engine().await;
    let (template_id, _) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    job(&e.db, "ABC123", "Senior Engineer", template_id).await;

    let outcome = e
        .matcher
        .ingest(&application("[ABC123] Applying for Senior Engineer", "<a1>"))
        .await
        .unwrap();
    let id = captured_instance(outcome);

    let done = wait_for_status(&e.db, id, InstanceStatus::Completed).await;
    assert_eq!(done.execution_log.len(), 2);
    assert!(done.current_step_detail_id.is_none());
    assert!(done.completed_at.is_some());
    assert_eq!(e.executor.calls(), vec!["Resume Analysis", "Welcome"]);

    let audit = e.db.list_audit(id).await.unwrap();
    assert_eq!(audit.first().map(|a| a.event.as_str()), Some("initiated"));
}

#[tokio::test]
async fn single_rejection_after_approval_rejects_instance() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Offer Approval").gated(&["a@acme.com", "b@acme.com"], Some(2)),
            StepSpec::auto(3, "Welcome"),
        ],
    )
    .await;
    job(&e.db, "ABC123", "Engineer", template_id).await;

    let id = captured_instance(
        e.matcher
            .ingest(&application("[ABC123] Application for Engineer", "<b1>"))
            .await
            .unwrap(),
    );
    wait_for_status(&e.db, id, InstanceStatus::AwaitingApproval).await;

    let requests = e.gate.requests_for(id).await.unwrap();
    assert_eq!(requests.len(), 2);
    let request_of = |who: &str| requests.iter().find(|r| r.approver_id == who).unwrap().id;

    let a = e
        .gate
        .submit_decision(request_of("a@acme.com"), "a@acme.com", Decision::Approved, None)
        .await
        .unwrap();
    assert_eq!(a.outcome, GateOutcome::Awaiting);
    assert!(!a.pass_enqueued);

    let b = e
        .gate
        .submit_decision(
            request_of("b@acme.com"),
            "b@acme.com",
            Decision::Rejected,
            Some("not a fit".into()),
        )
        .await
        .unwrap();
    assert_eq!(b.outcome, GateOutcome::Rejected);
    assert!(b.pass_enqueued);

    let rejected = wait_for_status(&e.db, id, InstanceStatus::Rejected).await;
    assert!(rejected.current_step_detail_id.is_none());
    assert!(rejected.execution_log.last().unwrap().is_rejection());

    let decisions = e.db.list_decisions(id, details[1]).await.unwrap();
    assert_eq!(decisions.len(), 2);
    assert_eq!(
        decisions.iter().filter(|d| d.decision == Decision::Approved).count(),
        1
    );
    assert_eq!(
        decisions.iter().filter(|d| d.decision == Decision::Rejected).count(),
        1
    );
    assert_eq!(e.executor.calls(), vec!["Resume Analysis"]);
}

#[tokio::test]
async fn quorum_of_two_needs_two_approvals() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Offer Approval").gated(&["a", "b", "c"], Some(2)),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    let id = instance(&e.db, template_id, details[0]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Awaiting);
    let requests = e.gate.requests_for(id).await.unwrap();
    assert_eq!(requests.len(), 3);

    let first = e
        .gate
        .submit_decision(requests[0].id, &requests[0].approver_id, Decision::Approved, None)
        .await
        .unwrap();
    assert_eq!(first.outcome, GateOutcome::Awaiting);
    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Awaiting);
    assert!(e.executor.calls().is_empty());

    let second = e
        .gate
        .submit_decision(requests[1].id, &requests[1].approver_id, Decision::Approved, None)
        .await
        .unwrap();
    assert_eq!(second.outcome, GateOutcome::Approved);

    let done = wait_for_status(&e.db, id, InstanceStatus::Completed).await;
    assert_eq!(done.execution_log.len(), 2);
    assert_eq!(e.executor.calls(), vec!["Offer Approval", "Welcome"]);

    // The third approver may still answer; it changes nothing.
    let late = e
        .gate
        .submit_decision(requests[2].id, &requests[2].approver_id, Decision::Approved, None)
        .await
        .unwrap();
    assert_eq!(late.decision.decision, Decision::Approved);
    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Terminal);
    assert_eq!(e.executor.calls_for("Offer Approval"), 1);
}

#[tokio::test]
async fn rejection_vetoes_with_decisions_pending() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[StepSpec::auto(1, "Offer Approval").gated(&["a", "b", "c"], Some(2))],
    )
    .await;
    let id = instance(&e.db, template_id, details[0]).await;
    e.dispatcher.submit_and_wait(id, manual()).await.unwrap();

    let requests = e.gate.requests_for(id).await.unwrap();
    let receipt = e
        .gate
        .submit_decision(requests[0].id, &requests[0].approver_id, Decision::Rejected, None)
        .await
        .unwrap();
    assert_eq!(receipt.outcome, GateOutcome::Rejected);

    wait_for_status(&e.db, id, InstanceStatus::Rejected).await;
    assert!(e.executor.calls().is_empty());

    let still_pending = e.gate.requests_for(id).await.unwrap();
    assert_eq!(
        still_pending
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .count(),
        2
    );
}

#[tokio::test]
async fn duplicate_decision_is_refused() {
    let e = engine().await;
    let (template_id, details) =
        template(&e.db, &[StepSpec::auto(1, "Offer Approval").gated(&["a", "b"], None)]).await;
    let id = instance(&e.db, template_id, details[0]).await;
    e.dispatcher.submit_and_wait(id, manual()).await.unwrap();

    let request = e.gate.requests_for(id).await.unwrap().remove(0);
    e.gate
        .submit_decision(request.id, &request.approver_id, Decision::Approved, None)
        .await
        .unwrap();
    let err = e
        .gate
        .submit_decision(request.id, &request.approver_id, Decision::Rejected, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        hire_flow::error::WorkflowError::DuplicateDecision { .. }
    ));
}

#[tokio::test]
async fn order_gaps_resolve_and_terminate() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(4, "Welcome"),
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Schedule Interview"),
        ],
    )
    .await;
    let id = instance(&e.db, template_id, details[1]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Completed);
    assert_eq!(report.steps_executed, 3);
    assert_eq!(
        e.executor.calls(),
        vec!["Resume Analysis", "Schedule Interview", "Welcome"]
    );
}

#[tokio::test]
async fn manual_step_waits_for_trigger() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::manual(2, "Schedule Interview"),
            StepSpec::auto(3, "Welcome"),
        ],
    )
    .await;
    let id = instance(&e.db, template_id, details[0]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Paused);
    assert_eq!(report.current_step_detail_id, Some(details[1]));
    assert_eq!(e.executor.calls(), vec!["Resume Analysis"]);

    // The triggered step itself runs even though it does not auto-start.
    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Completed);
    assert_eq!(
        e.executor.calls(),
        vec!["Resume Analysis", "Schedule Interview", "Welcome"]
    );
}

#[tokio::test]
async fn replayed_mail_creates_nothing_twice() {
    let e = engine().await;
    let (template_id, _) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Offer Approval").gated(&["a", "b"], None),
        ],
    )
    .await;
    let job = job(&e.db, "ABC123", "Engineer", template_id).await;

    let event = application("[ABC123] Application for Engineer", "<r1>");
    let id = captured_instance(e.matcher.ingest(&event).await.unwrap());
    wait_for_status(&e.db, id, InstanceStatus::AwaitingApproval).await;

    let again = e.matcher.ingest(&event).await.unwrap();
    assert_eq!(again.label(), "duplicate");

    let follow_up = application("[ABC123] Re: my application", "<r2>");
    let same = captured_instance(e.matcher.ingest(&follow_up).await.unwrap());
    assert_eq!(same, id);
    e.dispatcher.submit_and_wait(id, manual()).await.unwrap();

    assert_eq!(e.db.count_candidates(job.company_id).await.unwrap(), 1);
    assert_eq!(e.db.count_applications(job.id).await.unwrap(), 1);
    assert_eq!(e.gate.requests_for(id).await.unwrap().len(), 2);
    assert_eq!(e.executor.calls_for("Resume Analysis"), 1);
}

#[tokio::test]
async fn completed_instance_is_not_restarted() {
    let e = engine().await;
    let (template_id, _) = template(&e.db, &[StepSpec::auto(1, "Resume Analysis")]).await;
    let job = job(&e.db, "ABC123", "Engineer", template_id).await;

    let id = captured_instance(
        e.matcher
            .ingest(&application("[ABC123] Applying for Engineer", "<c1>"))
            .await
            .unwrap(),
    );
    wait_for_status(&e.db, id, InstanceStatus::Completed).await;

    let again = captured_instance(
        e.matcher
            .ingest(&application("[ABC123] Applying again for Engineer", "<c2>"))
            .await
            .unwrap(),
    );
    assert_eq!(again, id);
    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Terminal);

    assert_eq!(e.db.count_applications(job.id).await.unwrap(), 1);
    assert_eq!(e.executor.calls_for("Resume Analysis"), 1);
    let stored = e.db.get_instance(id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Completed);
    assert_eq!(stored.execution_log.len(), 1);
}

#[tokio::test]
async fn concurrent_triggers_run_each_step_once() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    e.executor
        .script("Resume Analysis", Script::Sleep(Duration::from_millis(50)));
    let id = instance(&e.db, template_id, details[0]).await;

    for _ in 0..5 {
        e.dispatcher.submit(id, manual()).unwrap();
    }
    let last = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(last.outcome, PassOutcome::Terminal);

    assert_eq!(e.executor.calls_for("Resume Analysis"), 1);
    assert_eq!(e.executor.calls_for("Welcome"), 1);
    let stored = e.db.get_instance(id).await.unwrap().unwrap();
    assert_eq!(stored.execution_log.len(), 2);
}

#[tokio::test]
async fn executor_timeout_parks_instance() {
    let config = EngineConfig {
        executor_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let e = engine_with(config).await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    e.executor
        .script("Resume Analysis", Script::Sleep(Duration::from_secs(5)));
    let id = instance(&e.db, template_id, details[0]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Parked);
    assert_eq!(report.status, InstanceStatus::Paused);
    assert_eq!(report.current_step_detail_id, Some(details[0]));

    let stored = e.db.get_instance(id).await.unwrap().unwrap();
    let entry = stored.execution_log.last().unwrap();
    assert_eq!(entry.status, "error");
    assert!(!entry.success);
}

#[tokio::test]
async fn executor_error_continues_as_approved() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    e.executor.script("Resume Analysis", Script::Fail);
    let id = instance(&e.db, template_id, details[0]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Completed);

    let stored = e.db.get_instance(id).await.unwrap().unwrap();
    assert_eq!(stored.execution_log[0].status, "approved");
    assert!(!stored.execution_log[0].success);
}

#[tokio::test]
async fn step_rejection_ends_pipeline() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::auto(1, "Resume Analysis"),
            StepSpec::auto(2, "Welcome"),
        ],
    )
    .await;
    e.executor.script(
        "Resume Analysis",
        Script::Reply(ExecutionResult::rejected("missing required skills")),
    );
    let id = instance(&e.db, template_id, details[0]).await;

    let report = e.dispatcher.submit_and_wait(id, manual()).await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Rejected);
    assert_eq!(e.executor.calls(), vec!["Resume Analysis"]);
    let stored = e.db.get_instance(id).await.unwrap().unwrap();
    assert_eq!(stored.derived_status(), InstanceStatus::Rejected);
}

#[tokio::test]
async fn irrelevant_mail_does_not_run_step() {
    let e = engine().await;
    let (template_id, details) = template(
        &e.db,
        &[
            StepSpec::manual(1, "Resume Analysis"),
            StepSpec::manual(2, "Schedule Interview"),
        ],
    )
    .await;
    let job = job(&e.db, "ABC123", "Engineer", template_id).await;
    let id = captured_instance(
        e.matcher
            .ingest(&application("[ABC123] Application for Engineer", "<i1>"))
            .await
            .unwrap(),
    );
    // The mail runs the first step; the manual second step parks the instance.
    let parked = wait_for_status(&e.db, id, InstanceStatus::Paused).await;
    assert_eq!(parked.current_step_detail_id, Some(details[1]));

    let chatter = InboundEvent::new(
        "Jane Smith <jane@example.com>",
        "[ABC123] Thanks",
        "Just saying thanks!",
        "<i2>",
    );
    e.matcher.ingest(&chatter).await.unwrap();
    let report = e
        .dispatcher
        .submit_and_wait(id, PassTrigger::Mail { event: chatter })
        .await
        .unwrap();
    assert_eq!(report.outcome, PassOutcome::NotRelevant);
    assert_eq!(e.executor.calls_for("Schedule Interview"), 0);
    assert_eq!(e.db.count_applications(job.id).await.unwrap(), 1);
}
