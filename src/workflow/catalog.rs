//! Workflow catalog: templates, step details and steps resolved into an
//! ordered pipeline.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::recruiting::{Job, JobStatus};
use crate::store::Database;
use crate::workflow::model::{
    ResolvedStep, Step, StepDetail, StepType, Template, distinct_approvers,
};

/// A template entry passed over because its step cannot be resolved.
#[derive(Debug, Clone)]
pub struct SkippedDetail {
    pub step_detail_id: Uuid,
    /// `None` when the detail row itself is gone.
    pub order_number: Option<u32>,
    pub reason: String,
}

/// Outcome of a first/next step lookup.
#[derive(Debug, Default)]
pub struct StepLookup {
    pub step: Option<ResolvedStep>,
    /// Unresolvable entries between the starting position and `step`.
    pub skipped: Vec<SkippedDetail>,
}

/// Read-mostly view over the catalog tables.
pub struct WorkflowCatalog {
    db: Arc<dyn Database>,
}

impl WorkflowCatalog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// All steps of a template, ordered by `order_number`.
    ///
    /// Strict: a missing detail or a soft-deleted or missing step is a
    /// configuration error.
    pub async fn resolve_template(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<ResolvedStep>, WorkflowError> {
        let (steps, skipped) = self.resolve_usable(template_id).await?;
        if let Some(unusable) = skipped.into_iter().next() {
            return Err(WorkflowError::Configuration(unusable.reason));
        }
        Ok(steps)
    }

    /// The step detail at an exact position, if any.
    pub async fn step_detail_at(
        &self,
        template_id: Uuid,
        order_number: u32,
    ) -> Result<Option<StepDetail>, WorkflowError> {
        Ok(self
            .resolve_template(template_id)
            .await?
            .into_iter()
            .find(|s| s.order_number() == order_number)
            .map(|s| s.detail))
    }

    /// A step detail joined with its (non-deleted) step.
    pub async fn resolve_step(&self, step_detail_id: Uuid) -> Result<ResolvedStep, WorkflowError> {
        let detail = self.db.get_step_detail(step_detail_id).await?.ok_or_else(|| {
            WorkflowError::Configuration(format!("step detail {step_detail_id} does not exist"))
        })?;
        let step = self.live_step(&detail).await?;
        Ok(ResolvedStep { detail, step })
    }

    async fn live_step(&self, detail: &StepDetail) -> Result<Step, WorkflowError> {
        match self.db.get_step(detail.step_id).await? {
            Some(step) if !step.is_deleted() => Ok(step),
            Some(_) => Err(WorkflowError::Configuration(format!(
                "step {} referenced by detail {} is deleted",
                detail.step_id, detail.id
            ))),
            None => Err(WorkflowError::Configuration(format!(
                "step {} referenced by detail {} does not exist",
                detail.step_id, detail.id
            ))),
        }
    }

    /// Resolvable steps of a template in order, plus the details that could
    /// not be resolved. Only a missing template or a duplicate order number
    /// is an error here.
    async fn resolve_usable(
        &self,
        template_id: Uuid,
    ) -> Result<(Vec<ResolvedStep>, Vec<SkippedDetail>), WorkflowError> {
        let template = self.db.get_template(template_id).await?.ok_or_else(|| {
            WorkflowError::Configuration(format!("template {template_id} does not exist"))
        })?;

        let mut steps = Vec::with_capacity(template.step_detail_ids.len());
        let mut skipped = Vec::new();
        for detail_id in &template.step_detail_ids {
            let Some(detail) = self.db.get_step_detail(*detail_id).await? else {
                warn!(%template_id, step_detail_id = %detail_id, "Template lists a missing step detail");
                skipped.push(SkippedDetail {
                    step_detail_id: *detail_id,
                    order_number: None,
                    reason: format!("step detail {detail_id} does not exist"),
                });
                continue;
            };
            match self.live_step(&detail).await {
                Ok(step) => steps.push(ResolvedStep { detail, step }),
                Err(WorkflowError::Configuration(reason)) => skipped.push(SkippedDetail {
                    step_detail_id: detail.id,
                    order_number: Some(detail.order_number),
                    reason,
                }),
                Err(e) => return Err(e),
            }
        }
        steps.sort_by_key(|s| s.order_number());

        if let Some(pair) = steps
            .windows(2)
            .find(|w| w[0].order_number() == w[1].order_number())
        {
            return Err(WorkflowError::Configuration(format!(
                "template {template_id} has two steps at order {}",
                pair[0].order_number()
            )));
        }

        Ok((steps, skipped))
    }

    /// The first usable step of a template.
    pub async fn first_step(&self, template_id: Uuid) -> Result<StepLookup, WorkflowError> {
        self.step_after(template_id, None).await
    }

    /// The usable step with the smallest order number greater than `after_order`.
    pub async fn next_step(
        &self,
        template_id: Uuid,
        after_order: u32,
    ) -> Result<StepLookup, WorkflowError> {
        self.step_after(template_id, Some(after_order)).await
    }

    async fn step_after(
        &self,
        template_id: Uuid,
        after_order: Option<u32>,
    ) -> Result<StepLookup, WorkflowError> {
        let (steps, skipped) = self.resolve_usable(template_id).await?;
        let beyond = |order: u32| after_order.is_none_or(|after| order > after);

        let step = steps.into_iter().find(|s| beyond(s.order_number()));
        let skipped = skipped
            .into_iter()
            // Entries without a known position cannot be placed, only warned about.
            .filter(|d| {
                d.order_number.is_some_and(|order| {
                    beyond(order) && step.as_ref().is_none_or(|s| order < s.order_number())
                })
            })
            .collect();
        Ok(StepLookup { step, skipped })
    }

    /// Load a JSON catalog seed from disk.
    pub async fn seed_from_file(&self, path: &Path) -> Result<SeedReport, WorkflowError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            WorkflowError::Configuration(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        let seed: CatalogSeed = serde_json::from_str(&raw).map_err(|e| {
            WorkflowError::Configuration(format!("invalid catalog {}: {e}", path.display()))
        })?;
        let report = self.seed(&seed).await?;
        info!(
            path = %path.display(),
            steps = report.steps,
            templates = report.templates,
            jobs = report.jobs,
            "Catalog seeded"
        );
        Ok(report)
    }

    /// Insert every entity of a seed that does not exist yet.
    pub async fn seed(&self, seed: &CatalogSeed) -> Result<SeedReport, WorkflowError> {
        let mut report = SeedReport::default();

        for s in &seed.steps {
            let step = Step {
                id: s.id,
                name: s.name.clone(),
                description: s.description.clone(),
                step_type: s
                    .step_type
                    .clone()
                    .unwrap_or_else(|| StepType::from_step_name(&s.name)),
                actions: s.actions.clone(),
                created_at: chrono::Utc::now(),
                deleted_at: None,
            };
            if self.db.insert_step(&step).await? {
                report.steps += 1;
            }
        }

        for t in &seed.templates {
            let mut detail_ids = Vec::with_capacity(t.steps.len());
            for d in &t.steps {
                let detail = StepDetail {
                    id: d.id,
                    template_id: t.id,
                    step_id: d.step_id,
                    order_number: d.order_number,
                    auto_start: d.auto_start,
                    required_human_approval: d.required_human_approval,
                    number_of_approvals_needed: d.number_of_approvals_needed,
                    approvers: distinct_approvers(d.approvers.iter().cloned()),
                    delay_in_seconds: d.delay_in_seconds,
                };
                if detail.required_human_approval && detail.approvers.is_empty() {
                    warn!(
                        template = %t.name,
                        order = detail.order_number,
                        "Step requires approval but lists no approvers; it will not be gated"
                    );
                }
                self.db.insert_step_detail(&detail).await?;
                detail_ids.push(detail.id);
            }

            let template = Template {
                id: t.id,
                name: t.name.clone(),
                description: t.description.clone(),
                step_detail_ids: detail_ids,
                created_at: chrono::Utc::now(),
            };
            if self.db.insert_template(&template).await? {
                report.templates += 1;
            }
        }

        for j in &seed.jobs {
            let job = Job {
                id: j.id,
                short_id: j.short_id.clone(),
                title: j.title.clone(),
                company_id: j.company_id,
                status: j.status.unwrap_or(JobStatus::Active),
                workflow_template_id: j.workflow_template_id,
                created_at: chrono::Utc::now(),
            };
            if self.db.insert_job(&job).await? {
                report.jobs += 1;
            }
        }

        Ok(report)
    }
}

/// Counts of entities created by a seed run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub steps: usize,
    pub templates: usize,
    pub jobs: usize,
}

/// JSON catalog document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub steps: Vec<SeedStep>,
    #[serde(default)]
    pub templates: Vec<SeedTemplate>,
    #[serde(default)]
    pub jobs: Vec<SeedJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedStep {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Guessed from the name when absent.
    #[serde(default)]
    pub step_type: Option<StepType>,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<SeedStepDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedStepDetail {
    pub id: Uuid,
    pub step_id: Uuid,
    pub order_number: u32,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub required_human_approval: bool,
    #[serde(default)]
    pub number_of_approvals_needed: Option<u32>,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub delay_in_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedJob {
    pub id: Uuid,
    pub short_id: String,
    pub title: String,
    pub company_id: Uuid,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub workflow_template_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn catalog() -> (Arc<dyn Database>, WorkflowCatalog) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let catalog = WorkflowCatalog::new(Arc::clone(&db));
        (db, catalog)
    }

    /// Insert a template whose details sit at the given order numbers.
    async fn template_with_orders(db: &Arc<dyn Database>, orders: &[u32]) -> (Uuid, Vec<Uuid>) {
        let template_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for order in orders {
            let step = Step::new(format!("Step {order}"), "", StepType::Informational);
            db.insert_step(&step).await.unwrap();
            let detail = StepDetail::new(template_id, step.id, *order);
            db.insert_step_detail(&detail).await.unwrap();
            ids.push(detail.id);
        }
        let mut template = Template::new("Pipeline", ids.clone());
        template.id = template_id;
        db.insert_template(&template).await.unwrap();
        (template_id, ids)
    }

    #[tokio::test]
    async fn resolves_in_order_with_gaps() {
        let (db, catalog) = catalog().await;
        let (template, _) = template_with_orders(&db, &[4, 1, 2]).await;

        let orders: Vec<u32> = catalog
            .resolve_template(template)
            .await
            .unwrap()
            .iter()
            .map(|s| s.order_number())
            .collect();
        assert_eq!(orders, vec![1, 2, 4]);

        let next = catalog.next_step(template, 2).await.unwrap().step.unwrap();
        assert_eq!(next.order_number(), 4);
        assert!(catalog.next_step(template, 4).await.unwrap().step.is_none());
        assert_eq!(
            catalog.first_step(template).await.unwrap().step.unwrap().order_number(),
            1
        );
        assert!(catalog.step_detail_at(template, 3).await.unwrap().is_none());
        assert!(catalog.step_detail_at(template, 4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_template_is_configuration_error() {
        let (_db, catalog) = catalog().await;
        let err = catalog.resolve_template(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn duplicate_order_is_configuration_error() {
        let (db, catalog) = catalog().await;
        let (template, _) = template_with_orders(&db, &[1, 2, 2]).await;
        let err = catalog.resolve_template(template).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn deleted_step_is_treated_as_missing() {
        let (db, catalog) = catalog().await;
        let (template, ids) = template_with_orders(&db, &[1, 2]).await;
        let detail = db.get_step_detail(ids[1]).await.unwrap().unwrap();
        db.soft_delete_step(detail.step_id).await.unwrap();

        assert!(matches!(
            catalog.resolve_step(ids[1]).await.unwrap_err(),
            WorkflowError::Configuration(_)
        ));
        assert!(catalog.resolve_template(template).await.is_err());
        assert!(catalog.resolve_step(ids[0]).await.is_ok());
    }

    #[tokio::test]
    async fn lookups_pass_over_deleted_steps() {
        let (db, catalog) = catalog().await;
        let (template, ids) = template_with_orders(&db, &[1, 2, 3]).await;
        for id in [ids[0], ids[2]] {
            let detail = db.get_step_detail(id).await.unwrap().unwrap();
            db.soft_delete_step(detail.step_id).await.unwrap();
        }

        let first = catalog.first_step(template).await.unwrap();
        assert_eq!(first.step.unwrap().detail_id(), ids[1]);
        assert_eq!(first.skipped.len(), 1);
        assert_eq!(first.skipped[0].step_detail_id, ids[0]);

        let last = catalog.next_step(template, 2).await.unwrap();
        assert!(last.step.is_none());
        assert_eq!(last.skipped.len(), 1);
        assert_eq!(last.skipped[0].order_number, Some(3));

        // Already behind the pointer, so not reported again.
        assert!(catalog.next_step(template, 3).await.unwrap().skipped.is_empty());
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let (db, catalog) = catalog().await;
        let step_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        let json = serde_json::json!({
            "steps": [{"id": step_id, "name": "Resume Screening"}],
            "templates": [{
                "id": template_id,
                "name": "Default",
                "steps": [{
                    "id": Uuid::new_v4(),
                    "step_id": step_id,
                    "order_number": 1,
                    "auto_start": true,
                    "required_human_approval": true,
                    "approvers": ["lead@acme.com", "lead@acme.com"]
                }]
            }],
            "jobs": [{
                "id": Uuid::new_v4(),
                "short_id": "ABC123",
                "title": "Senior Engineer",
                "company_id": Uuid::new_v4(),
                "status": "published",
                "workflow_template_id": template_id
            }]
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let first = catalog.seed_from_file(&path).await.unwrap();
        assert_eq!(
            first,
            SeedReport {
                steps: 1,
                templates: 1,
                jobs: 1
            }
        );
        let second = catalog.seed_from_file(&path).await.unwrap();
        assert_eq!(second, SeedReport::default());

        let steps = catalog.resolve_template(template_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step.step_type, StepType::ResumeAnalysis);
        assert_eq!(steps[0].detail.approvers, vec!["lead@acme.com".to_string()]);
        let job = db.get_job_by_short_id("ABC123").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn unreadable_seed_is_configuration_error() {
        let (_db, catalog) = catalog().await;
        let err = catalog
            .seed_from_file(Path::new("/nonexistent/catalog.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }
}
