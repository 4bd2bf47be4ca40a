//! Jobs, candidates and applications captured from inbound mail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    #[serde(alias = "published")]
    Active,
    Paused,
    Closed,
    Archived,
}

impl JobStatus {
    /// Whether inbound mail may still be matched to the job.
    pub fn accepts_applications(&self) -> bool {
        matches!(self, Self::Active | Self::Draft)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" | "published" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "closed" => Ok(Self::Closed),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Token quoted in mail subjects, e.g. `ABC123`.
    pub short_id: String,
    pub title: String,
    pub company_id: Uuid,
    pub status: JobStatus,
    pub workflow_template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(short_id: impl Into<String>, title: impl Into<String>, company_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            short_id: short_id.into(),
            title: title.into(),
            company_id,
            status: JobStatus::Active,
            workflow_template_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_template(mut self, template_id: Uuid) -> Self {
        self.workflow_template_id = Some(template_id);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Status assigned to candidates created from mail.
pub const CANDIDATE_STATUS_NEW: &str = "new";
/// Source recorded for candidates created from mail.
pub const CANDIDATE_SOURCE_EMAIL: &str = "email";
/// Status assigned to new applications.
pub const APPLICATION_STATUS_APPLIED: &str = "applied";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub company_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub status: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn from_sender(sender: &ParsedSender, company_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            email: sender.email.clone(),
            first_name: sender.first_name.clone(),
            last_name: sender.last_name.clone(),
            status: CANDIDATE_STATUS_NEW.to_string(),
            source: CANDIDATE_SOURCE_EMAIL.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub job_id: Uuid,
    pub candidate_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Application {
    pub fn new(job_id: Uuid, candidate_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            candidate_id,
            status: APPLICATION_STATUS_APPLIED.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Identity parsed out of a free-text `From` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSender {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}
