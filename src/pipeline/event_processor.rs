//! Background sweep over recorded inbound events that were never finished.
//!
//! Events are recorded as `pending` and claimed (`processing`) before
//! matching. A crash in between, or a database failure during capture
//! (`failed`), leaves them for this loop to pick up. Pending and processing
//! events are only swept once their claim grace has run out, and each one is
//! claimed again first, so an ingest still working on an event keeps it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::matcher::{InboundMatcher, claim_grace};
use crate::store::Database;

/// Events handled per tick.
const SWEEP_BATCH: usize = 50;

/// Spawn the sweep loop. Returns a `JoinHandle` and shutdown flag.
pub fn spawn_event_processor(
    db: Arc<dyn Database>,
    matcher: Arc<InboundMatcher>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Inbound event sweep started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbound event sweep shutting down");
                return;
            }

            sweep_once(&db, &matcher).await;
        }
    });

    (handle, shutdown_flag)
}

/// Process one batch of failed or abandoned events. Returns how many were handled.
pub async fn sweep_once(db: &Arc<dyn Database>, matcher: &InboundMatcher) -> usize {
    let now = Utc::now();
    let idle_before = now - claim_grace();
    let pending = match db.list_unprocessed_inbound_events(SWEEP_BATCH, idle_before).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to list unprocessed inbound events");
            return 0;
        }
    };
    if pending.is_empty() {
        return 0;
    }

    debug!(count = pending.len(), "Sweeping inbound events");
    let mut handled = 0;
    for stored in pending {
        let message_id = &stored.event.message_id;
        match db.claim_inbound_event(message_id, now, idle_before).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %message_id, "Inbound event claimed elsewhere, skipping");
                continue;
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to claim inbound event");
                continue;
            }
        }

        match matcher.process(&stored.event).await {
            Ok(outcome) => {
                handled += 1;
                debug!(
                    message_id = %message_id,
                    outcome = outcome.label(),
                    "Swept inbound event"
                );
            }
            // Left as failed; the next tick retries it.
            Err(e) => warn!(
                message_id = %message_id,
                error = %e,
                "Inbound event still failing"
            ),
        }
    }
    handled
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use uuid::Uuid;

    use super::*;
    use crate::error::WorkflowError;
    use crate::pipeline::types::{EventStatus, InboundEvent};
    use crate::recruiting::Job;
    use crate::store::LibSqlBackend;
    use crate::workflow::catalog::WorkflowCatalog;
    use crate::workflow::controller::{PassOutcome, PassReport};
    use crate::workflow::dispatcher::{PassRunner, dispatch_channel};
    use crate::workflow::model::{InstanceStatus, PassTrigger, Step, StepDetail, StepType, Template};

    /// Counts mail-triggered passes without running anything.
    #[derive(Default)]
    struct MailCounter {
        mail_passes: AtomicUsize,
    }

    #[async_trait]
    impl PassRunner for MailCounter {
        async fn run_pass(
            &self,
            instance_id: Uuid,
            trigger: PassTrigger,
        ) -> Result<PassReport, WorkflowError> {
            if matches!(trigger, PassTrigger::Mail { .. }) {
                self.mail_passes.fetch_add(1, Ordering::SeqCst);
            }
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

    fn matcher_over(db: &Arc<dyn Database>) -> InboundMatcher {
        let (dispatcher, _queue) = dispatch_channel();
        let catalog = Arc::new(WorkflowCatalog::new(Arc::clone(db)));
        InboundMatcher::new(Arc::clone(db), catalog, dispatcher)
    }

    fn long_ago() -> chrono::DateTime<Utc> {
        Utc::now() - TimeDelta::minutes(30)
    }

    #[tokio::test]
    async fn sweep_finishes_recorded_events() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let matcher = matcher_over(&db);

        let job = Job::new("ABC123", "Engineer", Uuid::new_v4());
        db.insert_job(&job).await.unwrap();

        let matched = InboundEvent::new("a@example.com", "[ABC123] Application", "", "<m1>");
        let unmatched = InboundEvent::new("b@example.com", "Newsletter", "", "<m2>");
        db.record_inbound_event(&matched, long_ago()).await.unwrap();
        db.record_inbound_event(&unmatched, long_ago()).await.unwrap();

        assert_eq!(sweep_once(&db, &matcher).await, 2);
        assert_eq!(
            db.get_inbound_event("<m1>").await.unwrap().unwrap().status,
            EventStatus::Processed
        );
        assert_eq!(
            db.get_inbound_event("<m2>").await.unwrap().unwrap().status,
            EventStatus::Dropped
        );
        assert_eq!(sweep_once(&db, &matcher).await, 0);
    }

    #[tokio::test]
    async fn sweep_leaves_claimed_event_to_its_owner() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let matcher = matcher_over(&db);
        let job = Job::new("ABC123", "Engineer", Uuid::new_v4());
        db.insert_job(&job).await.unwrap();

        // An ingest recorded and claimed this a moment ago and is still matching it.
        let event = InboundEvent::new("a@example.com", "[ABC123] Application", "", "<m1>");
        let now = Utc::now();
        db.record_inbound_event(&event, now).await.unwrap();
        assert!(
            db.claim_inbound_event("<m1>", now, now - claim_grace())
                .await
                .unwrap()
        );

        assert_eq!(sweep_once(&db, &matcher).await, 0);
        assert_eq!(db.count_candidates(job.company_id).await.unwrap(), 0);
        assert_eq!(
            db.get_inbound_event("<m1>").await.unwrap().unwrap().status,
            EventStatus::Processing
        );
    }

    #[tokio::test]
    async fn sweep_takes_over_abandoned_claim() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let matcher = matcher_over(&db);
        let job = Job::new("ABC123", "Engineer", Uuid::new_v4());
        db.insert_job(&job).await.unwrap();

        let event = InboundEvent::new("a@example.com", "[ABC123] Application", "", "<m1>");
        db.record_inbound_event(&event, long_ago()).await.unwrap();
        assert!(
            db.claim_inbound_event("<m1>", long_ago(), long_ago() - claim_grace())
                .await
                .unwrap()
        );

        assert_eq!(sweep_once(&db, &matcher).await, 1);
        assert_eq!(
            db.get_inbound_event("<m1>").await.unwrap().unwrap().status,
            EventStatus::Processed
        );
    }

    #[tokio::test]
    async fn sweep_during_ingest_submits_one_mail_pass() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let counter = Arc::new(MailCounter::default());
        let (dispatcher, queue) = dispatch_channel();
        queue.start(counter.clone(), 4);
        let catalog = Arc::new(WorkflowCatalog::new(Arc::clone(&db)));
        let matcher = InboundMatcher::new(Arc::clone(&db), catalog, dispatcher.clone());

        let step = Step::new("Resume Analysis", "", StepType::ResumeAnalysis);
        db.insert_step(&step).await.unwrap();
        let template_id = Uuid::new_v4();
        let detail = StepDetail::new(template_id, step.id, 1);
        db.insert_step_detail(&detail).await.unwrap();
        let mut template = Template::new("Default", vec![detail.id]);
        template.id = template_id;
        db.insert_template(&template).await.unwrap();
        let job = Job::new("ABC123", "Engineer", Uuid::new_v4()).with_template(template_id);
        db.insert_job(&job).await.unwrap();

        let event = InboundEvent::new("a@example.com", "[ABC123] Application", "", "<m1>");
        let (ingested, _) = tokio::join!(matcher.ingest(&event), async {
            tokio::task::yield_now().await;
            sweep_once(&db, &matcher).await
        });
        let crate::pipeline::types::IngestOutcome::Captured {
            instance: Some(instance),
            ..
        } = ingested.unwrap()
        else {
            panic!("expected capture with an instance");
        };

        // Same-instance passes run in order, so this waits out the mail pass.
        dispatcher
            .submit_and_wait(instance.id, PassTrigger::Manual { requested_by: None })
            .await
            .unwrap();
        assert_eq!(sweep_once(&db, &matcher).await, 0);
        assert_eq!(counter.mail_passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_flag_stops_loop() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let matcher = Arc::new(matcher_over(&db));

        let (handle, shutdown) =
            spawn_event_processor(db, matcher, Duration::from_millis(10));
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
