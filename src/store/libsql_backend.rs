//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases. Every write that must be
//! atomic is a single statement, so the one shared connection never needs
//! an explicit transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{EventStatus, InboundEvent, StoredEvent};
use crate::recruiting::{Application, Candidate, Job, JobStatus};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::workflow::model::{
    ApprovalDecision, ApprovalRequest, AuditEntry, Decision, InstanceStatus, LogEntry,
    RequestStatus, Step, StepDetail, StepType, Template, WorkflowInstance, distinct_approvers,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query expected to return at most one row and map it.
    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// Run a query and map every row.
    async fn query_all<T>(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
        map: fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(map(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }

    async fn count(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<u64, DatabaseError> {
        let n = self
            .query_one(op, sql, args, |row| int_col(row, 0))
            .await?
            .unwrap_or(0);
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn text_col(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn opt_text_col(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn bool_col(row: &libsql::Row, idx: i32) -> Result<bool, DatabaseError> {
    Ok(int_col(row, idx)? != 0)
}

fn uuid_col(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let raw = text_col(row, idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx} uuid '{raw}': {e}")))
}

fn opt_uuid_col(row: &libsql::Row, idx: i32) -> Result<Option<Uuid>, DatabaseError> {
    match opt_text_col(row, idx) {
        Some(raw) => Uuid::parse_str(&raw).map(Some).map_err(|e| {
            DatabaseError::Serialization(format!("column {idx} uuid '{raw}': {e}"))
        }),
        None => Ok(None),
    }
}

fn datetime_col(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>, DatabaseError> {
    Ok(parse_datetime(&text_col(row, idx)?))
}

fn opt_datetime_col(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    opt_text_col(row, idx).map(|s| parse_datetime(&s))
}

fn json_col<T: serde::de::DeserializeOwned>(
    row: &libsql::Row,
    idx: i32,
) -> Result<T, DatabaseError> {
    let raw = text_col(row, idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx} json: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, DatabaseError> {
    raw.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(|d| d.to_rfc3339()))
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text_owned(id.map(|u| u.to_string()))
}

fn opt_int(n: Option<u32>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(i64::from(n)),
        None => libsql::Value::Null,
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const STEP_COLUMNS: &str = "id, name, description, step_type, actions, created_at, deleted_at";

fn row_to_step(row: &libsql::Row) -> Result<Step, DatabaseError> {
    Ok(Step {
        id: uuid_col(row, 0)?,
        name: text_col(row, 1)?,
        description: text_col(row, 2)?,
        step_type: StepType::from(text_col(row, 3)?),
        actions: json_col(row, 4)?,
        created_at: datetime_col(row, 5)?,
        deleted_at: opt_datetime_col(row, 6),
    })
}

const STEP_DETAIL_COLUMNS: &str = "id, template_id, step_id, order_number, auto_start, \
    required_human_approval, number_of_approvals_needed, approvers, delay_in_seconds";

fn row_to_step_detail(row: &libsql::Row) -> Result<StepDetail, DatabaseError> {
    Ok(StepDetail {
        id: uuid_col(row, 0)?,
        template_id: uuid_col(row, 1)?,
        step_id: uuid_col(row, 2)?,
        order_number: u32::try_from(int_col(row, 3)?).unwrap_or(0),
        auto_start: bool_col(row, 4)?,
        required_human_approval: bool_col(row, 5)?,
        number_of_approvals_needed: row
            .get::<i64>(6)
            .ok()
            .and_then(|n| u32::try_from(n).ok()),
        approvers: distinct_approvers(json_col::<Vec<String>>(row, 7)?),
        delay_in_seconds: u64::try_from(int_col(row, 8)?).unwrap_or(0),
    })
}

const TEMPLATE_COLUMNS: &str = "id, name, description, step_detail_ids, created_at";

fn row_to_template(row: &libsql::Row) -> Result<Template, DatabaseError> {
    Ok(Template {
        id: uuid_col(row, 0)?,
        name: text_col(row, 1)?,
        description: text_col(row, 2)?,
        step_detail_ids: json_col(row, 3)?,
        created_at: datetime_col(row, 4)?,
    })
}

const JOB_COLUMNS: &str = "id, short_id, title, company_id, status, workflow_template_id, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: uuid_col(row, 0)?,
        short_id: text_col(row, 1)?,
        title: text_col(row, 2)?,
        company_id: uuid_col(row, 3)?,
        status: parse_enum::<JobStatus>(&text_col(row, 4)?)?,
        workflow_template_id: opt_uuid_col(row, 5)?,
        created_at: datetime_col(row, 6)?,
    })
}

const CANDIDATE_COLUMNS: &str =
    "id, company_id, email, first_name, last_name, status, source, created_at";

fn row_to_candidate(row: &libsql::Row) -> Result<Candidate, DatabaseError> {
    Ok(Candidate {
        id: uuid_col(row, 0)?,
        company_id: uuid_col(row, 1)?,
        email: text_col(row, 2)?,
        first_name: text_col(row, 3)?,
        last_name: text_col(row, 4)?,
        status: text_col(row, 5)?,
        source: text_col(row, 6)?,
        created_at: datetime_col(row, 7)?,
    })
}

const APPLICATION_COLUMNS: &str = "id, job_id, candidate_id, status, created_at";

fn row_to_application(row: &libsql::Row) -> Result<Application, DatabaseError> {
    Ok(Application {
        id: uuid_col(row, 0)?,
        job_id: uuid_col(row, 1)?,
        candidate_id: uuid_col(row, 2)?,
        status: text_col(row, 3)?,
        created_at: datetime_col(row, 4)?,
    })
}

const INSTANCE_COLUMNS: &str = "id, job_id, candidate_id, template_id, current_step_detail_id, \
    status, version, started_at, completed_at, execution_log, updated_at";

fn row_to_instance(row: &libsql::Row) -> Result<WorkflowInstance, DatabaseError> {
    let execution_log: Vec<LogEntry> = json_col(row, 9)?;
    Ok(WorkflowInstance {
        id: uuid_col(row, 0)?,
        job_id: uuid_col(row, 1)?,
        candidate_id: uuid_col(row, 2)?,
        template_id: uuid_col(row, 3)?,
        current_step_detail_id: opt_uuid_col(row, 4)?,
        status: parse_enum::<InstanceStatus>(&text_col(row, 5)?)?,
        version: int_col(row, 6)?,
        started_at: datetime_col(row, 7)?,
        completed_at: opt_datetime_col(row, 8),
        execution_log,
        updated_at: datetime_col(row, 10)?,
    })
}

const REQUEST_COLUMNS: &str =
    "id, instance_id, step_detail_id, approver_id, status, created_at, completed_at";

fn row_to_request(row: &libsql::Row) -> Result<ApprovalRequest, DatabaseError> {
    Ok(ApprovalRequest {
        id: uuid_col(row, 0)?,
        instance_id: uuid_col(row, 1)?,
        step_detail_id: uuid_col(row, 2)?,
        approver_id: text_col(row, 3)?,
        status: parse_enum::<RequestStatus>(&text_col(row, 4)?)?,
        created_at: datetime_col(row, 5)?,
        completed_at: opt_datetime_col(row, 6),
    })
}

const DECISION_COLUMNS: &str =
    "id, request_id, instance_id, step_detail_id, approver_id, decision, comments, decided_at";

fn row_to_decision(row: &libsql::Row) -> Result<ApprovalDecision, DatabaseError> {
    Ok(ApprovalDecision {
        id: uuid_col(row, 0)?,
        request_id: uuid_col(row, 1)?,
        instance_id: uuid_col(row, 2)?,
        step_detail_id: uuid_col(row, 3)?,
        approver_id: text_col(row, 4)?,
        decision: parse_enum::<Decision>(&text_col(row, 5)?)?,
        comments: opt_text_col(row, 6),
        decided_at: datetime_col(row, 7)?,
    })
}

const EVENT_COLUMNS: &str = "message_id, sender, subject, body, received_at, status, note";

fn row_to_event(row: &libsql::Row) -> Result<StoredEvent, DatabaseError> {
    Ok(StoredEvent {
        event: InboundEvent {
            message_id: text_col(row, 0)?,
            from: text_col(row, 1)?,
            subject: text_col(row, 2)?,
            body: text_col(row, 3)?,
        },
        received_at: datetime_col(row, 4)?,
        status: parse_enum::<EventStatus>(&text_col(row, 5)?)?,
        note: opt_text_col(row, 6),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, DatabaseError> {
    Ok(AuditEntry {
        instance_id: uuid_col(row, 0)?,
        event: text_col(row, 1)?,
        detail: opt_text_col(row, 2),
        at: datetime_col(row, 3)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Catalog ─────────────────────────────────────────────────────

    async fn insert_step(&self, step: &Step) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO steps (id, name, description, step_type, actions, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    step.id.to_string(),
                    step.name.as_str(),
                    step.description.as_str(),
                    step.step_type.as_str(),
                    to_json(&step.actions)?,
                    step.created_at.to_rfc3339(),
                    opt_datetime(step.deleted_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_step: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>, DatabaseError> {
        self.query_one(
            "get_step",
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            params![id.to_string()],
            row_to_step,
        )
        .await
    }

    async fn soft_delete_step(&self, id: Uuid) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE steps SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("soft_delete_step: {e}")))?;
        debug!(step_id = %id, changed, "Step soft-deleted");
        Ok(())
    }

    async fn insert_step_detail(&self, detail: &StepDetail) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO step_details (id, template_id, step_id, order_number, auto_start,
                    required_human_approval, number_of_approvals_needed, approvers, delay_in_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    detail.id.to_string(),
                    detail.template_id.to_string(),
                    detail.step_id.to_string(),
                    i64::from(detail.order_number),
                    i64::from(detail.auto_start),
                    i64::from(detail.required_human_approval),
                    opt_int(detail.number_of_approvals_needed),
                    to_json(&detail.approvers)?,
                    i64::try_from(detail.delay_in_seconds).unwrap_or(i64::MAX),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_step_detail: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_step_detail(&self, id: Uuid) -> Result<Option<StepDetail>, DatabaseError> {
        self.query_one(
            "get_step_detail",
            &format!("SELECT {STEP_DETAIL_COLUMNS} FROM step_details WHERE id = ?1"),
            params![id.to_string()],
            row_to_step_detail,
        )
        .await
    }

    async fn insert_template(&self, template: &Template) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO templates (id, name, description, step_detail_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    template.id.to_string(),
                    template.name.as_str(),
                    template.description.as_str(),
                    to_json(&template.step_detail_ids)?,
                    template.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_template: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>, DatabaseError> {
        self.query_one(
            "get_template",
            &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
            params![id.to_string()],
            row_to_template,
        )
        .await
    }

    // ── Jobs, candidates, applications ──────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO jobs (id, short_id, title, company_id, status, workflow_template_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.short_id.as_str(),
                    job.title.as_str(),
                    job.company_id.to_string(),
                    job.status.as_str(),
                    opt_uuid(job.workflow_template_id),
                    job.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.query_one(
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
            row_to_job,
        )
        .await
    }

    async fn get_job_by_short_id(&self, short_id: &str) -> Result<Option<Job>, DatabaseError> {
        self.query_one(
            "get_job_by_short_id",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE short_id = ?1"),
            params![short_id],
            row_to_job,
        )
        .await
    }

    async fn list_open_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.query_all(
            "list_open_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('active', 'published', 'draft')
                 ORDER BY created_at ASC"
            ),
            (),
            row_to_job,
        )
        .await
    }

    async fn find_candidate(
        &self,
        email: &str,
        company_id: Uuid,
    ) -> Result<Option<Candidate>, DatabaseError> {
        self.query_one(
            "find_candidate",
            &format!(
                "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE email = lower(?1) AND company_id = ?2"
            ),
            params![email, company_id.to_string()],
            row_to_candidate,
        )
        .await
    }

    async fn get_candidate(&self, id: Uuid) -> Result<Option<Candidate>, DatabaseError> {
        self.query_one(
            "get_candidate",
            &format!("SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = ?1"),
            params![id.to_string()],
            row_to_candidate,
        )
        .await
    }

    async fn insert_candidate_if_absent(
        &self,
        candidate: &Candidate,
    ) -> Result<(Candidate, bool), DatabaseError> {
        let email = candidate.email.to_lowercase();
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO candidates (id, company_id, email, first_name, last_name, status, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    candidate.id.to_string(),
                    candidate.company_id.to_string(),
                    email.as_str(),
                    candidate.first_name.as_str(),
                    candidate.last_name.as_str(),
                    candidate.status.as_str(),
                    candidate.source.as_str(),
                    candidate.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_candidate_if_absent: {e}")))?;

        let stored = self
            .find_candidate(&email, candidate.company_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "candidate".into(),
                id: email.clone(),
            })?;
        Ok((stored, inserted > 0))
    }

    async fn count_candidates(&self, company_id: Uuid) -> Result<u64, DatabaseError> {
        self.count(
            "count_candidates",
            "SELECT COUNT(*) FROM candidates WHERE company_id = ?1",
            params![company_id.to_string()],
        )
        .await
    }

    async fn find_application(
        &self,
        job_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<Application>, DatabaseError> {
        self.query_one(
            "find_application",
            &format!(
                "SELECT {APPLICATION_COLUMNS} FROM applications WHERE job_id = ?1 AND candidate_id = ?2"
            ),
            params![job_id.to_string(), candidate_id.to_string()],
            row_to_application,
        )
        .await
    }

    async fn insert_application_if_absent(
        &self,
        application: &Application,
    ) -> Result<(Application, bool), DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO applications (id, job_id, candidate_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    application.id.to_string(),
                    application.job_id.to_string(),
                    application.candidate_id.to_string(),
                    application.status.as_str(),
                    application.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_application_if_absent: {e}")))?;

        let stored = self
            .find_application(application.job_id, application.candidate_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "application".into(),
                id: application.id.to_string(),
            })?;
        Ok((stored, inserted > 0))
    }

    async fn count_applications(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        self.count(
            "count_applications",
            "SELECT COUNT(*) FROM applications WHERE job_id = ?1",
            params![job_id.to_string()],
        )
        .await
    }

    // ── Workflow instances ──────────────────────────────────────────

    async fn insert_instance_if_absent(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(WorkflowInstance, bool), DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO workflow_instances (id, job_id, candidate_id, template_id,
                    current_step_detail_id, status, version, started_at, completed_at, execution_log, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    instance.id.to_string(),
                    instance.job_id.to_string(),
                    instance.candidate_id.to_string(),
                    instance.template_id.to_string(),
                    opt_uuid(instance.current_step_detail_id),
                    instance.status.to_string(),
                    instance.version,
                    instance.started_at.to_rfc3339(),
                    opt_datetime(instance.completed_at),
                    to_json(&instance.execution_log)?,
                    instance.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_instance_if_absent: {e}")))?;

        let stored = self
            .find_instance(instance.job_id, instance.candidate_id, instance.template_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "workflow_instance".into(),
                id: instance.id.to_string(),
            })?;
        Ok((stored, inserted > 0))
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, DatabaseError> {
        self.query_one(
            "get_instance",
            &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?1"),
            params![id.to_string()],
            row_to_instance,
        )
        .await
    }

    async fn find_instance(
        &self,
        job_id: Uuid,
        candidate_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<WorkflowInstance>, DatabaseError> {
        self.query_one(
            "find_instance",
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 WHERE job_id = ?1 AND candidate_id = ?2 AND template_id = ?3"
            ),
            params![
                job_id.to_string(),
                candidate_id.to_string(),
                template_id.to_string()
            ],
            row_to_instance,
        )
        .await
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, DatabaseError> {
        self.query_all(
            "list_instances_by_status",
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE status = ?1
                 ORDER BY updated_at ASC"
            ),
            params![status.to_string()],
            row_to_instance,
        )
        .await
    }

    async fn commit_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: i64,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workflow_instances
                 SET current_step_detail_id = ?1, status = ?2, version = ?3, completed_at = ?4,
                     execution_log = ?5, updated_at = ?6
                 WHERE id = ?7 AND version = ?8",
                params![
                    opt_uuid(instance.current_step_detail_id),
                    instance.status.to_string(),
                    expected_version + 1,
                    opt_datetime(instance.completed_at),
                    to_json(&instance.execution_log)?,
                    Utc::now().to_rfc3339(),
                    instance.id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_instance: {e}")))?;

        debug!(
            instance_id = %instance.id,
            expected_version,
            committed = changed > 0,
            "Instance transition"
        );
        Ok(changed > 0)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO instance_audit (instance_id, event, detail, at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.instance_id.to_string(),
                    entry.event.as_str(),
                    opt_text_owned(entry.detail.clone()),
                    entry.at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_audit: {e}")))?;
        Ok(())
    }

    async fn list_audit(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.query_all(
            "list_audit",
            "SELECT instance_id, event, detail, at FROM instance_audit
             WHERE instance_id = ?1 ORDER BY id ASC",
            params![instance_id.to_string()],
            row_to_audit,
        )
        .await
    }

    // ── Approvals ───────────────────────────────────────────────────

    async fn insert_approval_request_if_absent(
        &self,
        request: &ApprovalRequest,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO approval_requests
                    (id, instance_id, step_detail_id, approver_id, status, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    request.id.to_string(),
                    request.instance_id.to_string(),
                    request.step_detail_id.to_string(),
                    request.approver_id.as_str(),
                    request.status.as_str(),
                    request.created_at.to_rfc3339(),
                    opt_datetime(request.completed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_approval_request_if_absent: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_approval_request(
        &self,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, DatabaseError> {
        self.query_one(
            "get_approval_request",
            &format!("SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE id = ?1"),
            params![id.to_string()],
            row_to_request,
        )
        .await
    }

    async fn list_approval_requests(
        &self,
        instance_id: Uuid,
        step_detail_id: Option<Uuid>,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        match step_detail_id {
            Some(step) => {
                self.query_all(
                    "list_approval_requests",
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM approval_requests
                         WHERE instance_id = ?1 AND step_detail_id = ?2 ORDER BY created_at ASC"
                    ),
                    params![instance_id.to_string(), step.to_string()],
                    row_to_request,
                )
                .await
            }
            None => {
                self.query_all(
                    "list_approval_requests",
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM approval_requests
                         WHERE instance_id = ?1 ORDER BY created_at ASC"
                    ),
                    params![instance_id.to_string()],
                    row_to_request,
                )
                .await
            }
        }
    }

    async fn list_pending_approval_requests(
        &self,
        approver_id: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        match approver_id {
            Some(approver) => {
                self.query_all(
                    "list_pending_approval_requests",
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM approval_requests
                         WHERE status = 'pending' AND approver_id = ?1 ORDER BY created_at ASC"
                    ),
                    params![approver],
                    row_to_request,
                )
                .await
            }
            None => {
                self.query_all(
                    "list_pending_approval_requests",
                    &format!(
                        "SELECT {REQUEST_COLUMNS} FROM approval_requests
                         WHERE status = 'pending' ORDER BY created_at ASC"
                    ),
                    (),
                    row_to_request,
                )
                .await
            }
        }
    }

    async fn list_decided_approval_requests(
        &self,
        approver_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ApprovalRequest>, DatabaseError> {
        self.query_all(
            "list_decided_approval_requests",
            &format!(
                "SELECT {REQUEST_COLUMNS} FROM approval_requests
                 WHERE status != 'pending' AND approver_id = ?1
                 ORDER BY completed_at DESC LIMIT ?2 OFFSET ?3"
            ),
            params![
                approver_id,
                i64::try_from(limit).unwrap_or(i64::MAX),
                i64::try_from(offset).unwrap_or(0)
            ],
            row_to_request,
        )
        .await
    }

    async fn update_approval_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE approval_requests SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), opt_datetime(completed_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_approval_request_status: {e}")))?;
        Ok(())
    }

    async fn insert_decision_if_absent(
        &self,
        decision: &ApprovalDecision,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO approval_decisions
                    (id, request_id, instance_id, step_detail_id, approver_id, decision, comments, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    decision.id.to_string(),
                    decision.request_id.to_string(),
                    decision.instance_id.to_string(),
                    decision.step_detail_id.to_string(),
                    decision.approver_id.as_str(),
                    decision.decision.as_str(),
                    opt_text_owned(decision.comments.clone()),
                    decision.decided_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_decision_if_absent: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_decision_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ApprovalDecision>, DatabaseError> {
        self.query_one(
            "get_decision_for_request",
            &format!("SELECT {DECISION_COLUMNS} FROM approval_decisions WHERE request_id = ?1"),
            params![request_id.to_string()],
            row_to_decision,
        )
        .await
    }

    async fn list_decisions(
        &self,
        instance_id: Uuid,
        step_detail_id: Uuid,
    ) -> Result<Vec<ApprovalDecision>, DatabaseError> {
        self.query_all(
            "list_decisions",
            &format!(
                "SELECT {DECISION_COLUMNS} FROM approval_decisions
                 WHERE instance_id = ?1 AND step_detail_id = ?2 ORDER BY decided_at ASC"
            ),
            params![instance_id.to_string(), step_detail_id.to_string()],
            row_to_decision,
        )
        .await
    }

    // ── Inbound events ──────────────────────────────────────────────

    async fn record_inbound_event(
        &self,
        event: &InboundEvent,
        received_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO inbound_events
                    (message_id, sender, subject, body, received_at, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    event.message_id.as_str(),
                    event.from.as_str(),
                    event.subject.as_str(),
                    event.body.as_str(),
                    received_at.to_rfc3339(),
                    received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound_event: {e}")))?;
        Ok(inserted > 0)
    }

    async fn get_inbound_event(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredEvent>, DatabaseError> {
        self.query_one(
            "get_inbound_event",
            &format!("SELECT {EVENT_COLUMNS} FROM inbound_events WHERE message_id = ?1"),
            params![message_id],
            row_to_event,
        )
        .await
    }

    async fn claim_inbound_event(
        &self,
        message_id: &str,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let claimed = self
            .conn()
            .execute(
                "UPDATE inbound_events SET status = 'processing', updated_at = ?1
                 WHERE message_id = ?2
                   AND (status IN ('pending', 'failed')
                        OR (status = 'processing' AND updated_at < ?3))",
                params![
                    claimed_at.to_rfc3339(),
                    message_id,
                    stale_before.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_inbound_event: {e}")))?;
        Ok(claimed > 0)
    }

    async fn list_unprocessed_inbound_events(
        &self,
        limit: usize,
        idle_before: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, DatabaseError> {
        self.query_all(
            "list_unprocessed_inbound_events",
            &format!(
                "SELECT {EVENT_COLUMNS} FROM inbound_events
                 WHERE status = 'failed'
                    OR (status IN ('pending', 'processing') AND updated_at < ?1)
                 ORDER BY received_at ASC LIMIT ?2"
            ),
            params![
                idle_before.to_rfc3339(),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            row_to_event,
        )
        .await
    }

    async fn update_inbound_event_status(
        &self,
        message_id: &str,
        status: EventStatus,
        note: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE inbound_events SET status = ?1, note = ?2, updated_at = ?3 WHERE message_id = ?4",
                params![
                    status.as_str(),
                    opt_text_owned(note.map(str::to_string)),
                    Utc::now().to_rfc3339(),
                    message_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_inbound_event_status: {e}")))?;
        Ok(())
    }
}
