//! Pass dispatcher: the internal event queue in front of the controller.
//!
//! Requests are partitioned by instance id. A router task owns the set of
//! busy instances; a request for a busy instance waits behind the running
//! pass, so passes for one instance never overlap. Passes for different
//! instances run concurrently up to a semaphore limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::workflow::controller::{PassOutcome, PassReport};
use crate::workflow::model::PassTrigger;

/// Something that can run one progression pass.
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(
        &self,
        instance_id: Uuid,
        trigger: PassTrigger,
    ) -> Result<PassReport, WorkflowError>;
}

type PassReply = oneshot::Sender<Result<PassReport, WorkflowError>>;

struct PassRequest {
    instance_id: Uuid,
    trigger: PassTrigger,
    reply: Option<PassReply>,
}

/// Cloneable handle for enqueueing passes.
#[derive(Clone)]
pub struct PassDispatcher {
    tx: mpsc::UnboundedSender<PassRequest>,
}

/// Receiving side; `start` spawns the router.
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<PassRequest>,
    tx: mpsc::WeakUnboundedSender<PassRequest>,
}

/// Create a dispatcher handle and its (not yet started) queue.
///
/// The handle exists before the runner so the approval gate can hold one
/// while the controller is still being built.
pub fn dispatch_channel() -> (PassDispatcher, DispatchQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let weak = tx.downgrade();
    (PassDispatcher { tx }, DispatchQueue { rx, tx: weak })
}

impl PassDispatcher {
    /// Enqueue a pass without waiting for it.
    pub fn submit(&self, instance_id: Uuid, trigger: PassTrigger) -> Result<(), WorkflowError> {
        debug!(instance_id = %instance_id, trigger = trigger.kind(), "Pass submitted");
        self.tx
            .send(PassRequest {
                instance_id,
                trigger,
                reply: None,
            })
            .map_err(|_| WorkflowError::DispatcherClosed)
    }

    /// Enqueue a pass and wait for its report.
    pub async fn submit_and_wait(
        &self,
        instance_id: Uuid,
        trigger: PassTrigger,
    ) -> Result<PassReport, WorkflowError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PassRequest {
                instance_id,
                trigger,
                reply: Some(reply_tx),
            })
            .map_err(|_| WorkflowError::DispatcherClosed)?;
        reply_rx.await.map_err(|_| WorkflowError::DispatcherClosed)?
    }

    /// Enqueue a pass once `delay` has elapsed. Not durable across restarts.
    pub fn submit_after(&self, delay: Duration, instance_id: Uuid, trigger: PassTrigger) {
        let tx = self.tx.clone();
        info!(
            instance_id = %instance_id,
            delay_secs = delay.as_secs(),
            trigger = trigger.kind(),
            "Pass scheduled"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let request = PassRequest {
                instance_id,
                trigger,
                reply: None,
            };
            if tx.send(request).is_err() {
                warn!(instance_id = %instance_id, "Dispatcher closed before scheduled pass");
            }
        });
    }
}

impl DispatchQueue {
    /// Spawn the router. It exits once every `PassDispatcher` is dropped and
    /// in-flight passes have drained.
    pub fn start(self, runner: Arc<dyn PassRunner>, max_concurrent: usize) -> JoinHandle<()> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        tokio::spawn(route(self.rx, self.tx, runner, semaphore))
    }
}

async fn route(
    mut rx: mpsc::UnboundedReceiver<PassRequest>,
    weak_tx: mpsc::WeakUnboundedSender<PassRequest>,
    runner: Arc<dyn PassRunner>,
    semaphore: Arc<Semaphore>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Uuid>();
    let mut busy: HashMap<Uuid, VecDeque<PassRequest>> = HashMap::new();
    let mut open = true;

    loop {
        tokio::select! {
            request = rx.recv(), if open => match request {
                Some(request) => {
                    if let Some(waiting) = busy.get_mut(&request.instance_id) {
                        debug!(
                            instance_id = %request.instance_id,
                            queued = waiting.len() + 1,
                            "Instance busy, pass queued"
                        );
                        waiting.push_back(request);
                    } else {
                        busy.insert(request.instance_id, VecDeque::new());
                        spawn_pass(request, &runner, &semaphore, &done_tx, &weak_tx);
                    }
                }
                None => open = false,
            },
            Some(instance_id) = done_rx.recv() => {
                match busy.get_mut(&instance_id).and_then(VecDeque::pop_front) {
                    Some(next) => spawn_pass(next, &runner, &semaphore, &done_tx, &weak_tx),
                    None => {
                        busy.remove(&instance_id);
                    }
                }
            }
        }

        if !open && busy.is_empty() {
            break;
        }
    }
    debug!("Pass dispatcher stopped");
}

fn spawn_pass(
    request: PassRequest,
    runner: &Arc<dyn PassRunner>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::UnboundedSender<Uuid>,
    weak_tx: &mpsc::WeakUnboundedSender<PassRequest>,
) {
    let runner = Arc::clone(runner);
    let semaphore = Arc::clone(semaphore);
    let done_tx = done_tx.clone();
    let weak_tx = weak_tx.clone();

    tokio::spawn(async move {
        let PassRequest {
            instance_id,
            trigger,
            reply,
        } = request;

        // The pass runs in its own task so a panic surfaces as a JoinError
        // and the instance is still released below.
        let result = match semaphore.acquire_owned().await {
            Ok(_permit) => {
                match tokio::spawn(async move { runner.run_pass(instance_id, trigger).await }).await
                {
                    Ok(result) => result,
                    Err(e) => {
                        error!(instance_id = %instance_id, error = %e, "Progression pass panicked");
                        Err(WorkflowError::PassAborted { instance_id })
                    }
                }
            }
            Err(_) => Err(WorkflowError::DispatcherClosed),
        };

        match &result {
            Ok(report) => {
                if let PassOutcome::Deferred {
                    step_detail_id,
                    delay_secs,
                } = report.outcome
                    && let Some(tx) = weak_tx.upgrade()
                {
                    PassDispatcher { tx }.submit_after(
                        Duration::from_secs(delay_secs),
                        instance_id,
                        PassTrigger::Scheduled { step_detail_id },
                    );
                }
            }
            Err(e) => error!(instance_id = %instance_id, error = %e, "Progression pass failed"),
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        let _ = done_tx.send(instance_id);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::workflow::model::InstanceStatus;

    /// Tracks how many passes run at once, per instance and overall.
    #[derive(Default)]
    struct Tracker {
        running: tokio::sync::Mutex<HashMap<Uuid, usize>>,
        max_per_instance: AtomicUsize,
        total: AtomicUsize,
        deferred_once: AtomicUsize,
    }

    fn report(instance_id: Uuid, trigger: &PassTrigger, outcome: PassOutcome) -> PassReport {
        PassReport {
            instance_id,
            trigger: trigger.kind(),
            outcome,
            steps_executed: 0,
            status: InstanceStatus::Running,
            current_step_detail_id: None,
        }
    }

    #[async_trait]
    impl PassRunner for Tracker {
        async fn run_pass(
            &self,
            instance_id: Uuid,
            trigger: PassTrigger,
        ) -> Result<PassReport, WorkflowError> {
            {
                let mut running = self.running.lock().await;
                let n = running.entry(instance_id).or_insert(0);
                *n += 1;
                self.max_per_instance.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.running.lock().await.get_mut(&instance_id).unwrap() -= 1;
            self.total.fetch_add(1, Ordering::SeqCst);

            if matches!(trigger, PassTrigger::Manual { .. })
                && self.deferred_once.fetch_add(1, Ordering::SeqCst) == 0
                && instance_id == Uuid::nil()
            {
                return Ok(report(
                    instance_id,
                    &trigger,
                    PassOutcome::Deferred {
                        step_detail_id: Uuid::nil(),
                        delay_secs: 0,
                    },
                ));
            }
            Ok(report(instance_id, &trigger, PassOutcome::Terminal))
        }
    }

    fn manual() -> PassTrigger {
        PassTrigger::Manual { requested_by: None }
    }

    #[tokio::test]
    async fn passes_for_one_instance_never_overlap() {
        let tracker = Arc::new(Tracker::default());
        let (dispatcher, queue) = dispatch_channel();
        queue.start(tracker.clone(), 8);

        let id = Uuid::new_v4();
        for _ in 0..5 {
            dispatcher.submit(id, PassTrigger::Scheduled { step_detail_id: id }).unwrap();
        }
        let report = dispatcher.submit_and_wait(id, manual()).await.unwrap();
        assert_eq!(report.instance_id, id);
        assert_eq!(tracker.total.load(Ordering::SeqCst), 6);
        assert_eq!(tracker.max_per_instance.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_instances_all_complete() {
        let tracker = Arc::new(Tracker::default());
        let (dispatcher, queue) = dispatch_channel();
        queue.start(tracker.clone(), 2);

        let waits: Vec<_> = (0..4)
            .map(|_| {
                let d = dispatcher.clone();
                tokio::spawn(async move { d.submit_and_wait(Uuid::new_v4(), manual()).await })
            })
            .collect();
        for w in waits {
            assert!(w.await.unwrap().is_ok());
        }
        assert_eq!(tracker.total.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn deferred_outcome_schedules_follow_up() {
        let tracker = Arc::new(Tracker::default());
        let (dispatcher, queue) = dispatch_channel();
        queue.start(tracker.clone(), 2);

        let report = dispatcher.submit_and_wait(Uuid::nil(), manual()).await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::Deferred { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.total.load(Ordering::SeqCst), 2);
    }

    /// Panics on its first pass, then reports normally.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PassRunner for PanicsOnce {
        async fn run_pass(
            &self,
            instance_id: Uuid,
            trigger: PassTrigger,
        ) -> Result<PassReport, WorkflowError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("pass blew up");
            }
            Ok(report(instance_id, &trigger, PassOutcome::Terminal))
        }
    }

    #[tokio::test]
    async fn panicking_pass_releases_instance() {
        let (dispatcher, queue) = dispatch_channel();
        queue.start(Arc::new(PanicsOnce::default()), 1);

        let id = Uuid::new_v4();
        let err = dispatcher.submit_and_wait(id, manual()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::PassAborted { instance_id } if instance_id == id));

        let report = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.submit_and_wait(id, manual()),
        )
        .await
        .expect("instance stayed busy after a panic")
        .unwrap();
        assert_eq!(report.outcome, PassOutcome::Terminal);
    }

    #[tokio::test]
    async fn router_stops_when_handles_drop() {
        let tracker = Arc::new(Tracker::default());
        let (dispatcher, queue) = dispatch_channel();
        let handle = queue.start(tracker, 1);
        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let (dispatcher, queue) = dispatch_channel();
        drop(queue);
        assert!(matches!(
            dispatcher.submit(Uuid::new_v4(), manual()),
            Err(WorkflowError::DispatcherClosed)
        ));
    }
}
