//! Shared types for the inbound mail pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recruiting::{Application, Candidate, Job};
use crate::workflow::model::WorkflowInstance;

// ── Inbound event ───────────────────────────────────────────────────

/// A raw candidate email, as delivered by the poller or the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Free-text `From` header, e.g. `Jane Smith <jane@example.com>`.
    pub from: String,
    pub subject: String,
    /// Body or snippet.
    #[serde(default, alias = "snippet")]
    pub body: String,
    /// Mail `Message-ID`; the idempotency key for ingestion.
    pub message_id: String,
}

impl InboundEvent {
    pub fn new(
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            subject: subject.into(),
            body: body.into(),
            message_id: message_id.into(),
        }
    }
}

/// Processing state of a recorded inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Recorded, not yet matched.
    Pending,
    /// Claimed by an ingest or a sweep that is matching it right now.
    Processing,
    /// Matched to a job; entities captured.
    Processed,
    /// No job matched. Never retried.
    Dropped,
    /// Entity capture failed; retried on the next sweep.
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Dropped => "dropped",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "dropped" => Ok(Self::Dropped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown event status: {s}")),
        }
    }
}

/// An inbound event as persisted in the `inbound_events` table.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: InboundEvent,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    pub note: Option<String>,
}

// ── Ingestion outcome ───────────────────────────────────────────────

/// What ingesting one inbound event produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The message id was already handled.
    Duplicate { message_id: String },
    /// No job matched the subject; the event is dropped.
    Unmatched { message_id: String },
    /// Entities captured. `instance` is `None` when the job has no template
    /// or the workflow could not be started.
    Captured {
        job: Job,
        candidate: Candidate,
        application: Application,
        instance: Option<WorkflowInstance>,
    },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::Unmatched { .. } => "unmatched",
            Self::Captured { .. } => "captured",
        }
    }
}
