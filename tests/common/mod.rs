//! Shared wiring for integration tests: an in-memory engine with a
//! scripted step executor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use hire_flow::channels::{BroadcastNotifier, FanoutNotifier, LogNotifier, Notifier};
use hire_flow::config::EngineConfig;
use hire_flow::error::ExecutorError;
use hire_flow::pipeline::InboundMatcher;
use hire_flow::recruiting::Job;
use hire_flow::store::{Database, LibSqlBackend};
use hire_flow::workflow::model::{
    ExecutionResult, InstanceStatus, Step, StepDetail, StepType, Template, WorkflowInstance,
};
use hire_flow::workflow::{
    ApprovalGate, ExecutionRequest, ExecutorRegistry, PassDispatcher, ProgressionController,
    StepExecutor, StepGateway, WorkflowCatalog, dispatch_channel,
};

/// What the scripted executor does for a step name.
#[derive(Clone)]
pub enum Script {
    Reply(ExecutionResult),
    Fail,
    Sleep(Duration),
}

/// Approves every step unless told otherwise, and records each call.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn script(&self, step_name: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(step_name.to_string(), script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_name: &str) -> usize {
        self.calls().iter().filter(|c| *c == step_name).count()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        let name = request.step.name().to_string();
        self.calls.lock().unwrap().push(name.clone());
        let script = self.scripts.lock().unwrap().get(&name).cloned();
        match script {
            None => Ok(ExecutionResult::approved(format!("{name} done"))),
            Some(Script::Reply(result)) => Ok(result),
            Some(Script::Fail) => Err(ExecutorError::Failed {
                step_type: request.step.step.step_type.to_string(),
                reason: "scripted failure".into(),
            }),
            Some(Script::Sleep(d)) => {
                tokio::time::sleep(d).await;
                Ok(ExecutionResult::approved("slept"))
            }
        }
    }
}

pub struct TestEngine {
    pub db: Arc<dyn Database>,
    pub catalog: Arc<WorkflowCatalog>,
    pub gate: Arc<ApprovalGate>,
    pub dispatcher: PassDispatcher,
    pub matcher: Arc<InboundMatcher>,
    pub executor: Arc<ScriptedExecutor>,
    pub feed: Arc<BroadcastNotifier>,
}

pub async fn engine() -> TestEngine {
    engine_with(EngineConfig::default()).await
}

pub async fn engine_with(config: EngineConfig) -> TestEngine {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let catalog = Arc::new(WorkflowCatalog::new(Arc::clone(&db)));

    let feed = Arc::new(BroadcastNotifier::new(64));
    let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier), feed.clone()];
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(notifiers));

    let executor = Arc::new(ScriptedExecutor::default());
    let registry = Arc::new(ExecutorRegistry::new());
    registry.set_fallback(executor.clone()).await;
    let gateway = Arc::new(StepGateway::new(
        registry,
        config.executor_timeout,
        config.failure_policy.clone(),
    ));

    let (dispatcher, queue) = dispatch_channel();
    let gate = Arc::new(ApprovalGate::new(
        Arc::clone(&db),
        notifier,
        dispatcher.clone(),
    ));
    let controller = Arc::new(ProgressionController::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        Arc::clone(&gate),
        gateway,
        config.clone(),
    ));
    queue.start(controller, config.max_concurrent_passes);

    let matcher = Arc::new(InboundMatcher::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        dispatcher.clone(),
    ));

    TestEngine {
        db,
        catalog,
        gate,
        dispatcher,
        matcher,
        executor,
        feed,
    }
}

/// One step of a test template.
#[derive(Clone)]
pub struct StepSpec {
    pub name: &'static str,
    pub order: u32,
    pub auto_start: bool,
    pub approvers: Vec<&'static str>,
    pub quorum: Option<u32>,
    pub delay_secs: u64,
}

impl StepSpec {
    pub fn auto(order: u32, name: &'static str) -> Self {
        Self {
            name,
            order,
            auto_start: true,
            approvers: Vec::new(),
            quorum: None,
            delay_secs: 0,
        }
    }

    pub fn manual(order: u32, name: &'static str) -> Self {
        Self {
            auto_start: false,
            ..Self::auto(order, name)
        }
    }

    pub fn gated(mut self, approvers: &[&'static str], quorum: Option<u32>) -> Self {
        self.approvers = approvers.to_vec();
        self.quorum = quorum;
        self
    }
}

/// Insert steps, details and a template. Returns the template id and the
/// step detail ids in the order given.
pub async fn template(db: &Arc<dyn Database>, specs: &[StepSpec]) -> (Uuid, Vec<Uuid>) {
    let template_id = Uuid::new_v4();
    let mut detail_ids = Vec::new();
    for spec in specs {
        let step = Step::new(spec.name, "", StepType::from_step_name(spec.name));
        db.insert_step(&step).await.unwrap();
        let mut detail = StepDetail::new(template_id, step.id, spec.order)
            .with_auto_start(spec.auto_start)
            .with_delay(spec.delay_secs);
        if !spec.approvers.is_empty() {
            detail = detail.with_approvers(&spec.approvers, spec.quorum);
        }
        db.insert_step_detail(&detail).await.unwrap();
        detail_ids.push(detail.id);
    }
    let mut tmpl = Template::new("Test pipeline", detail_ids.clone());
    tmpl.id = template_id;
    db.insert_template(&tmpl).await.unwrap();
    (template_id, detail_ids)
}

/// An open job bound to a template.
pub async fn job(db: &Arc<dyn Database>, short_id: &str, title: &str, template_id: Uuid) -> Job {
    let job = Job::new(short_id, title, Uuid::new_v4()).with_template(template_id);
    db.insert_job(&job).await.unwrap();
    job
}

/// An instance started directly, bypassing mail intake.
pub async fn instance(db: &Arc<dyn Database>, template_id: Uuid, first_step: Uuid) -> Uuid {
    let instance = WorkflowInstance::new(Uuid::new_v4(), Uuid::new_v4(), template_id, first_step);
    let (stored, _) = db.insert_instance_if_absent(&instance).await.unwrap();
    stored.id
}

/// Poll until the instance reaches `status`, or panic after two seconds.
pub async fn wait_for_status(
    db: &Arc<dyn Database>,
    instance_id: Uuid,
    status: InstanceStatus,
) -> WorkflowInstance {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = db.get_instance(instance_id).await.unwrap().unwrap();
        if current.status == status {
            return current;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "instance {instance_id} stuck at {} (wanted {status})",
                current.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
