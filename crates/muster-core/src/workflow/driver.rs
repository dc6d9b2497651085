//! Plan Driver Loop: moves one plan from creation to a terminal state.
//!
//! Each pass:
//!   1. ask the store for ready tasks (most urgent first)
//!   2. local role → mark `inprogress` and spawn the worker under a deadline
//!   3. remote role → send a one-time activation and move on
//!   4. sleep until a worker finishes, the plan changes, cancellation, or
//!      the housekeeping tick
//!
//! The loop never blocks on a worker: every dispatched task runs on its own
//! tokio task with a supervisor that enforces the heartbeat deadline and
//! writes the outcome to the plan store. Outcomes of workers that finish
//! after the loop has exited (for example after cancellation) are still
//! recorded.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collaboration::CollaborationBroker;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::artifact::plan_artifact_prefix;
use crate::models::plan::{FailureReason, PlanStatus};
use crate::models::task::{TaskState, TaskStatus};
use crate::store::artifact_store::ArtifactStore;
use crate::store::plan_store::PlanStore;
use crate::workflow::worker::{
    Assignment, TaskDescriptor, TaskOutcome, Worker, WorkerContext, WorkerRegistry,
};

/// Final picture of a plan once its driver loop exits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub plan_id: String,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub tasks: Vec<TaskState>,
    /// Every artifact key produced by the plan's tasks.
    pub artifacts: Vec<String>,
}

impl PlanReport {
    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Timing knobs taken from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub default_task_timeout: Duration,
    pub tick: Duration,
    pub collaboration_retention: Duration,
}

impl From<&EngineConfig> for DriverOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_task_timeout: config.default_task_timeout(),
            tick: config.driver_tick(),
            collaboration_retention: config.collaboration_retention(),
        }
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

pub struct PlanDriver {
    store: Arc<PlanStore>,
    workers: Arc<WorkerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    broker: CollaborationBroker,
    options: DriverOptions,
}

impl PlanDriver {
    pub fn new(
        store: Arc<PlanStore>,
        workers: Arc<WorkerRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        broker: CollaborationBroker,
        options: DriverOptions,
    ) -> Self {
        Self {
            store,
            workers,
            artifacts,
            broker,
            options,
        }
    }

    /// Drive `plan_id` until it is terminal with nothing local in flight, or
    /// until `cancel` fires.
    ///
    /// On cancellation unstarted tasks are skipped and the plan fails with
    /// reason `cancelled`; tasks already `inprogress` are left as they are.
    pub async fn run(&self, plan_id: &str, cancel: CancellationToken) -> Result<PlanReport> {
        let mut plan_changes = self.store.watch_plan(plan_id)?;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut activated: HashSet<String> = HashSet::new();
        let mut unassigned: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(self.options.tick);

        tracing::info!("[Driver] Starting plan {}", plan_id);

        loop {
            if cancel.is_cancelled() {
                self.store.cancel_plan(plan_id)?;
                tracing::info!(
                    "[Driver] Plan {} cancelled with {} task(s) still in flight",
                    plan_id,
                    in_flight.len()
                );
                break;
            }

            plan_changes.borrow_and_update();
            for task in self.store.ready_tasks(plan_id)? {
                match self.workers.lookup(&task.assignee) {
                    Assignment::Local(worker) => {
                        if in_flight.contains(&task.id) {
                            continue;
                        }
                        match self.store.update_task_status(&task.id, TaskStatus::InProgress, None) {
                            Ok(_) => {}
                            // Claimed by someone else between the read and the write.
                            Err(EngineError::InvalidTransition { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                        self.dispatch(worker, &task, &cancel, done_tx.clone());
                        in_flight.insert(task.id.clone());
                    }
                    Assignment::Remote(activation) => {
                        if activated.insert(task.id.clone()) {
                            let descriptor =
                                TaskDescriptor::from_task(&task, self.options.default_task_timeout);
                            if activation.send(descriptor).is_err() {
                                tracing::warn!(
                                    "[Driver] Remote role '{}' is gone; task {} stays ready",
                                    task.assignee,
                                    task.id
                                );
                            } else {
                                tracing::info!(
                                    "[Driver] Activated remote role '{}' for {}",
                                    task.assignee,
                                    task.id
                                );
                            }
                        }
                    }
                    Assignment::Unassigned => {
                        if unassigned.insert(task.id.clone()) {
                            tracing::warn!(
                                "[Driver] No worker for role '{}'; task {} waits for an external update",
                                task.assignee,
                                task.id
                            );
                        }
                    }
                }
            }

            if self.store.get_plan_status(plan_id)?.status.is_terminal() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(task_id) = done_rx.recv() => {
                    in_flight.remove(&task_id);
                }
                changed = plan_changes.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::NotFound(format!("Plan not found: {}", plan_id)));
                    }
                }
                _ = cancel.cancelled() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.broker.purge_expired(self.options.collaboration_retention) {
                        tracing::warn!("[Driver] Collaboration purge failed: {}", e);
                    }
                }
            }
        }

        let report = self.report(plan_id).await?;
        tracing::info!(
            "[Driver] Plan {} finished: {} ({}/{} completed, {} artifact(s))",
            plan_id,
            report.status,
            report.count_with_status(TaskStatus::Completed),
            report.tasks.len(),
            report.artifacts.len()
        );
        Ok(report)
    }

    /// Spawn the worker plus a supervisor that enforces the deadline, records
    /// the outcome in the store and then reports the task id on `done`.
    fn dispatch(
        &self,
        worker: Arc<dyn Worker>,
        task: &TaskState,
        cancel: &CancellationToken,
        done: mpsc::UnboundedSender<String>,
    ) {
        let store = self.store.clone();
        let descriptor = TaskDescriptor::from_task(task, self.options.default_task_timeout);
        let timeout = descriptor.timeout;
        let task_id = descriptor.task_id.clone();

        let (heartbeat_tx, mut heartbeat_rx) = watch::channel(0u64);
        let heartbeat_tx = Arc::new(heartbeat_tx);
        let ctx = WorkerContext::new(
            &descriptor,
            self.artifacts.clone(),
            self.broker.clone(),
            cancel.child_token(),
            heartbeat_tx.clone(),
        );

        tracing::info!(
            "[Driver] Dispatching {} to '{}' (deadline {}s)",
            task_id,
            descriptor.assignee,
            timeout.as_secs()
        );

        let mut handle = tokio::spawn(async move { worker.execute(descriptor, ctx).await });

        tokio::spawn(async move {
            // Held so heartbeat_rx never reports a closed channel.
            let _heartbeat_tx = heartbeat_tx;
            let mut deadline = Instant::now() + timeout;

            let outcome = loop {
                tokio::select! {
                    joined = &mut handle => {
                        break match joined {
                            Ok(outcome) => outcome,
                            Err(e) if e.is_panic() => TaskOutcome::failed("worker panicked"),
                            Err(_) => TaskOutcome::failed("worker aborted"),
                        };
                    }
                    _ = heartbeat_rx.changed() => {
                        deadline = Instant::now() + timeout;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        handle.abort();
                        tracing::warn!(
                            "[Driver] Task {} missed its deadline of {}s; worker aborted",
                            task_id,
                            timeout.as_secs()
                        );
                        break TaskOutcome::failed(format!(
                            "no progress within {}s",
                            timeout.as_secs()
                        ));
                    }
                }
            };

            record_outcome(&store, &task_id, outcome);
            // The loop may already be gone; the outcome is recorded either way.
            let _ = done.send(task_id);
        });
    }

    async fn report(&self, plan_id: &str) -> Result<PlanReport> {
        let plan = self.store.get_plan(plan_id)?;
        let artifacts = self.artifacts.list(&plan_artifact_prefix(plan_id)).await?;
        Ok(PlanReport {
            plan_id: plan.id,
            status: plan.status,
            failure_reason: plan.failure_reason,
            tasks: plan.tasks,
            artifacts,
        })
    }
}

fn record_outcome(store: &PlanStore, task_id: &str, outcome: TaskOutcome) {
    let (status, summary) = match outcome {
        TaskOutcome::Completed { summary } => (TaskStatus::Completed, summary),
        TaskOutcome::Failed { reason } => {
            tracing::warn!("[Driver] Task {} failed: {}", task_id, reason);
            (TaskStatus::Error, reason)
        }
    };
    if let Err(e) = store.update_task_status(task_id, status, Some(summary)) {
        tracing::warn!("[Driver] Could not record result of {}: {}", task_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressPublisher;
    use crate::store::artifact_store::MemoryArtifactStore;
    use crate::workflow::schema::PlanTemplate;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Producer;

    #[async_trait]
    impl Worker for Producer {
        fn role(&self) -> &str {
            "producer"
        }

        async fn execute(&self, task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
            for key in &task.output_artifacts {
                let name = key.rsplit('/').next().unwrap_or("out");
                if let Err(e) = ctx.save_json(name, &serde_json::json!({"from": task.task_id})).await {
                    return TaskOutcome::failed(e.to_string());
                }
            }
            TaskOutcome::completed(format!("{} done", task.name))
        }
    }

    struct Silent;

    #[async_trait]
    impl Worker for Silent {
        fn role(&self) -> &str {
            "silent"
        }

        async fn execute(&self, _task: TaskDescriptor, _ctx: WorkerContext) -> TaskOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            TaskOutcome::completed("never")
        }
    }

    struct Heartbeating;

    #[async_trait]
    impl Worker for Heartbeating {
        fn role(&self) -> &str {
            "steady"
        }

        async fn execute(&self, _task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(600)).await;
                ctx.heartbeat();
            }
            TaskOutcome::completed("kept alive")
        }
    }

    /// Keeps working for a moment after the plan is cancelled.
    struct Finisher;

    #[async_trait]
    impl Worker for Finisher {
        fn role(&self) -> &str {
            "finisher"
        }

        async fn execute(&self, _task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
            ctx.cancellation().cancelled().await;
            tokio::time::sleep(Duration::from_millis(150)).await;
            TaskOutcome::completed("wrapped up after cancel")
        }
    }

    fn driver(store: Arc<PlanStore>, workers: WorkerRegistry) -> PlanDriver {
        PlanDriver::new(
            store,
            Arc::new(workers),
            Arc::new(MemoryArtifactStore::new()),
            CollaborationBroker::new(),
            DriverOptions {
                default_task_timeout: Duration::from_secs(5),
                tick: Duration::from_millis(20),
                collaboration_retention: Duration::from_secs(60),
            },
        )
    }

    fn single_task(role: &str, timeout: u64) -> PlanTemplate {
        PlanTemplate::from_yaml(&format!(
            r#"
name: single
steps:
  - id: s
    tasks:
      - {{ id: t, name: T, assignee: {}, timeout_seconds: {} }}
"#,
            role, timeout
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_runs_chain_to_completion() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let template = PlanTemplate::from_yaml(
            r#"
name: chain
steps:
  - id: s1
    tasks:
      - { id: a, name: A, assignee: producer, output_artifacts: [first] }
  - id: s2
    tasks:
      - { id: b, name: B, assignee: producer, input_artifacts: [first], output_artifacts: [second] }
"#,
        )
        .unwrap();
        let plan_id = store.create_plan(&template, HashMap::new()).unwrap();

        let workers = WorkerRegistry::new();
        workers.register(Arc::new(Producer)).unwrap();
        let report = driver(store, workers)
            .run(&plan_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, PlanStatus::Completed);
        assert_eq!(report.count_with_status(TaskStatus::Completed), 2);
        assert_eq!(report.artifacts.len(), 2);
        assert_eq!(report.tasks[1].result_summary.as_deref(), Some("B done"));
    }

    #[tokio::test]
    async fn test_silent_worker_hits_deadline() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let plan_id = store.create_plan(&single_task("silent", 1), HashMap::new()).unwrap();

        let workers = WorkerRegistry::new();
        workers.register(Arc::new(Silent)).unwrap();
        let report = driver(store, workers)
            .run(&plan_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, PlanStatus::Failed);
        assert_eq!(report.tasks[0].status, TaskStatus::Error);
        assert!(report.tasks[0]
            .result_summary
            .as_deref()
            .unwrap_or_default()
            .contains("no progress"));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_deadline() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let plan_id = store.create_plan(&single_task("steady", 1), HashMap::new()).unwrap();

        let workers = WorkerRegistry::new();
        workers.register(Arc::new(Heartbeating)).unwrap();
        let report = driver(store, workers)
            .run(&plan_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_remote_role_is_activated_once() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let plan_id = store.create_plan(&single_task("field-team", 30), HashMap::new()).unwrap();

        let workers = WorkerRegistry::new();
        let mut activations = workers.register_remote("field-team").unwrap();
        let driver = driver(store.clone(), workers);

        let remote_store = store.clone();
        let remote = tokio::spawn(async move {
            let task = activations.recv().await.unwrap();
            remote_store
                .update_task_status(&task.task_id, TaskStatus::InProgress, None)
                .unwrap();
            remote_store
                .update_task_status(&task.task_id, TaskStatus::Completed, Some("reported".into()))
                .unwrap();
            // No second activation for the same task.
            assert!(activations.try_recv().is_err());
        });

        let report = driver.run(&plan_id, CancellationToken::new()).await.unwrap();
        remote.await.unwrap();
        assert_eq!(report.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_leaves_in_progress_task_alone() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let template = PlanTemplate::from_yaml(
            r#"
name: cancel
steps:
  - id: s1
    tasks:
      - { id: slow, name: Slow, assignee: silent, timeout_seconds: 60 }
  - id: s2
    tasks:
      - { id: later, name: Later, assignee: silent }
"#,
        )
        .unwrap();
        let plan_id = store.create_plan(&template, HashMap::new()).unwrap();

        let workers = WorkerRegistry::new();
        workers.register(Arc::new(Silent)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = driver(store, workers).run(&plan_id, cancel).await.unwrap();
        assert_eq!(report.status, PlanStatus::Failed);
        assert_eq!(report.failure_reason, Some(FailureReason::Cancelled));
        assert_eq!(report.tasks[0].status, TaskStatus::InProgress);
        assert_eq!(report.tasks[1].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_outcome_after_cancel_is_still_recorded() {
        let store = Arc::new(PlanStore::new(ProgressPublisher::default()));
        let plan_id = store
            .create_plan(&single_task("finisher", 30), HashMap::new())
            .unwrap();
        let task_id = TaskState::task_id(&plan_id, "s", "t");

        let workers = WorkerRegistry::new();
        workers.register(Arc::new(Finisher)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = driver(store.clone(), workers).run(&plan_id, cancel).await.unwrap();
        assert_eq!(report.failure_reason, Some(FailureReason::Cancelled));
        assert_eq!(report.tasks[0].status, TaskStatus::InProgress);

        tokio::time::sleep(Duration::from_millis(450)).await;
        let task = store.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_summary.as_deref(), Some("wrapped up after cancel"));
        assert_eq!(
            store.get_plan_status(&plan_id).unwrap().failure_reason,
            Some(FailureReason::Cancelled)
        );
    }
}
