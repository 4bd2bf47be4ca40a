//! Inbound event matcher.
//!
//! Turns a raw candidate email into a job match, captured candidate and
//! application records, and a workflow instance handed to the dispatcher.
//! Entity capture commits on its own; a failure to start or continue the
//! workflow never rolls it back.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, WorkflowError};
use crate::pipeline::rules::{SubjectRules, looks_like_application, titles_match};
use crate::pipeline::types::{EventStatus, IngestOutcome, InboundEvent};
use crate::recruiting::{Application, Candidate, Job, extract_short_id};
use crate::store::Database;
use crate::workflow::catalog::WorkflowCatalog;
use crate::workflow::dispatcher::PassDispatcher;
use crate::workflow::model::{AuditEntry, PassTrigger, WorkflowInstance};

/// How long a `processing` claim keeps the sweep away from an event.
pub const CLAIM_GRACE_SECS: i64 = 120;

pub fn claim_grace() -> TimeDelta {
    TimeDelta::seconds(CLAIM_GRACE_SECS)
}

pub struct InboundMatcher {
    db: Arc<dyn Database>,
    catalog: Arc<WorkflowCatalog>,
    dispatcher: PassDispatcher,
    rules: SubjectRules,
}

impl InboundMatcher {
    pub fn new(
        db: Arc<dyn Database>,
        catalog: Arc<WorkflowCatalog>,
        dispatcher: PassDispatcher,
    ) -> Self {
        Self {
            db,
            catalog,
            dispatcher,
            rules: SubjectRules::default_rules(),
        }
    }

    /// Record an event by message id, claim it and process it. Already-seen
    /// ids are reported as duplicates and not processed again.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<IngestOutcome, IngestError> {
        validate(event)?;

        let now = Utc::now();
        if !self.db.record_inbound_event(event, now).await?
            || !self
                .db
                .claim_inbound_event(&event.message_id, now, now - claim_grace())
                .await?
        {
            debug!(message_id = %event.message_id, "Inbound event already recorded");
            return Ok(IngestOutcome::Duplicate {
                message_id: event.message_id.clone(),
            });
        }
        self.process(event).await
    }

    /// Match and capture an already-recorded event, updating its status.
    ///
    /// The caller must hold the event's claim.
    pub async fn process(&self, event: &InboundEvent) -> Result<IngestOutcome, IngestError> {
        let Some(job) = self.match_job(&event.subject).await? else {
            info!(
                message_id = %event.message_id,
                subject = %event.subject,
                looks_like_application = looks_like_application(event),
                "No job matched, dropping event"
            );
            self.db
                .update_inbound_event_status(&event.message_id, EventStatus::Dropped, None)
                .await?;
            return Ok(IngestOutcome::Unmatched {
                message_id: event.message_id.clone(),
            });
        };

        let captured = async {
            let candidate = self.upsert_candidate(&event.from, job.company_id).await?;
            let application = self.upsert_application(job.id, candidate.id).await?;
            Ok::<_, IngestError>((candidate, application))
        }
        .await;

        let (candidate, application) = match captured {
            Ok(pair) => pair,
            Err(IngestError::InvalidEvent(reason)) => {
                warn!(message_id = %event.message_id, %reason, "Unusable sender, dropping event");
                self.db
                    .update_inbound_event_status(
                        &event.message_id,
                        EventStatus::Dropped,
                        Some(&reason),
                    )
                    .await?;
                return Err(IngestError::InvalidEvent(reason));
            }
            Err(e) => {
                error!(message_id = %event.message_id, error = %e, "Entity capture failed");
                let note = e.to_string();
                if let Err(status_err) = self
                    .db
                    .update_inbound_event_status(&event.message_id, EventStatus::Failed, Some(&note))
                    .await
                {
                    warn!(message_id = %event.message_id, error = %status_err, "Could not mark event failed");
                }
                return Err(e);
            }
        };

        self.db
            .update_inbound_event_status(&event.message_id, EventStatus::Processed, None)
            .await?;

        let instance = match self.initiate_or_continue(&job, &candidate, event).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(
                    job_id = %job.id,
                    candidate_id = %candidate.id,
                    error = %e,
                    "Could not start workflow; entities kept"
                );
                None
            }
        };

        info!(
            message_id = %event.message_id,
            job = %job.short_id,
            candidate = %candidate.email,
            instance_id = ?instance.as_ref().map(|i| i.id),
            "Inbound event captured"
        );

        Ok(IngestOutcome::Captured {
            job,
            candidate,
            application,
            instance,
        })
    }

    /// Find the open job a subject refers to. A bracketed short id is
    /// authoritative: when present only that job can match. Otherwise the
    /// longest job title matching the extracted title wins.
    pub async fn match_job(&self, subject: &str) -> Result<Option<Job>, IngestError> {
        if let Some(token) = extract_short_id(subject) {
            return Ok(match self.db.get_job_by_short_id(token).await? {
                Some(job) if job.status.accepts_applications() => {
                    debug!(short_id = %token, job_id = %job.id, "Matched job by short id");
                    Some(job)
                }
                Some(job) => {
                    debug!(short_id = %token, status = job.status.as_str(), "Job not open");
                    None
                }
                None => {
                    debug!(short_id = %token, "Unknown short id");
                    None
                }
            });
        }

        let title = self.rules.extract_title(subject);
        let mut best: Option<Job> = None;
        for job in self.db.list_open_jobs().await? {
            if !titles_match(&title, &job.title) {
                continue;
            }
            if best.as_ref().is_none_or(|b| job.title.len() > b.title.len()) {
                best = Some(job);
            }
        }
        if let Some(job) = &best {
            debug!(title = %title, job_id = %job.id, "Matched job by title");
        }
        Ok(best)
    }

    /// Existing candidate for the sender's address in this company, or a new one.
    pub async fn upsert_candidate(
        &self,
        from: &str,
        company_id: uuid::Uuid,
    ) -> Result<Candidate, IngestError> {
        let sender = self
            .rules
            .parse_sender(from)
            .ok_or_else(|| IngestError::InvalidEvent(format!("no address in sender: {from}")))?;

        if let Some(existing) = self.db.find_candidate(&sender.email, company_id).await? {
            return Ok(existing);
        }
        let (candidate, created) = self
            .db
            .insert_candidate_if_absent(&Candidate::from_sender(&sender, company_id))
            .await?;
        if created {
            info!(candidate_id = %candidate.id, email = %candidate.email, "Candidate created");
        }
        Ok(candidate)
    }

    pub async fn upsert_application(
        &self,
        job_id: uuid::Uuid,
        candidate_id: uuid::Uuid,
    ) -> Result<Application, IngestError> {
        if let Some(existing) = self.db.find_application(job_id, candidate_id).await? {
            return Ok(existing);
        }
        let (application, created) = self
            .db
            .insert_application_if_absent(&Application::new(job_id, candidate_id))
            .await?;
        if created {
            info!(application_id = %application.id, %job_id, %candidate_id, "Application created");
        }
        Ok(application)
    }

    /// Find or create the instance for (job, candidate, template) and hand it
    /// to the dispatcher. `None` when the job has no template.
    pub async fn initiate_or_continue(
        &self,
        job: &Job,
        candidate: &Candidate,
        event: &InboundEvent,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let Some(template_id) = job.workflow_template_id else {
            debug!(job_id = %job.id, "Job has no workflow template");
            return Ok(None);
        };

        let instance = match self
            .db
            .find_instance(job.id, candidate.id, template_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let lookup = self.catalog.first_step(template_id).await?;
                let first = lookup.step.ok_or_else(|| {
                    WorkflowError::Configuration(format!("template {template_id} has no usable steps"))
                })?;
                let fresh =
                    WorkflowInstance::new(job.id, candidate.id, template_id, first.detail_id());
                let (stored, created) = self.db.insert_instance_if_absent(&fresh).await?;
                if created {
                    info!(
                        instance_id = %stored.id,
                        job_id = %job.id,
                        candidate_id = %candidate.id,
                        first_step = %first.name(),
                        "Workflow initiated"
                    );
                    self.audit(stored.id, "initiated", Some(event.message_id.clone()))
                        .await;
                    for skipped in &lookup.skipped {
                        warn!(
                            instance_id = %stored.id,
                            step_detail_id = %skipped.step_detail_id,
                            reason = %skipped.reason,
                            "Skipped unresolvable step"
                        );
                        self.audit(stored.id, "step_skipped", Some(skipped.reason.clone()))
                            .await;
                    }
                }
                stored
            }
        };

        // The instance exists either way; a closed dispatcher only delays it
        // until the next trigger.
        if let Err(e) = self.dispatcher.submit(
            instance.id,
            PassTrigger::Mail {
                event: event.clone(),
            },
        ) {
            error!(instance_id = %instance.id, error = %e, "Could not dispatch pass");
        }
        Ok(Some(instance))
    }

    async fn audit(&self, instance_id: uuid::Uuid, event: &str, detail: Option<String>) {
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
}

fn validate(event: &InboundEvent) -> Result<(), IngestError> {
    if event.message_id.trim().is_empty() {
        return Err(IngestError::InvalidEvent("message_id is empty".into()));
    }
    if event.from.trim().is_empty() {
        return Err(IngestError::InvalidEvent("from is empty".into()));
    }
    Ok(())
}
