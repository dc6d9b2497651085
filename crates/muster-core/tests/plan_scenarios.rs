//! End-to-end plan scenarios driven through the public `Engine` API.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use muster_core::models::{FailureReason, PlanStatus, TaskStatus};
use muster_core::workflow::{TaskDescriptor, TaskOutcome};
use muster_core::{
    CollaborationOutcome, Engine, EngineConfig, MemoryArtifactStore, PlanTemplate,
    SqliteArtifactStore, TemplateRegistry, Worker, WorkerContext,
};

const TWO_STEP_TWO_TASK: &str = r#"
name: "two-step-two-task"
version: "1.0"
steps:
  - id: step1
    tasks:
      - id: task1
        name: "Collect readings"
        assignee: W1
        priority: critical
        output_artifacts: [out]
  - id: step2
    tasks:
      - id: task2
        name: "Analyse readings"
        assignee: W2
        priority: high
        input_artifacts: [out]
"#;

/// Saves `{"x": 1}` to every declared output.
struct Collector;

#[async_trait]
impl Worker for Collector {
    fn role(&self) -> &str {
        "W1"
    }

    async fn execute(&self, task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
        for key in &task.output_artifacts {
            let name = key.rsplit('/').next().unwrap_or_default();
            if let Err(e) = ctx.save_json(name, &serde_json::json!({"x": 1})).await {
                return TaskOutcome::failed(e.to_string());
            }
        }
        TaskOutcome::completed("readings collected")
    }
}

/// Reads every input and reports the value of `x`.
struct Analyst;

#[async_trait]
impl Worker for Analyst {
    fn role(&self) -> &str {
        "W2"
    }

    async fn execute(&self, task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
        let mut total = 0;
        for key in &task.input_artifacts {
            match ctx.load_json::<serde_json::Value>(key).await {
                Ok(value) => total += value["x"].as_i64().unwrap_or_default(),
                Err(e) => return TaskOutcome::failed(e.to_string()),
            }
        }
        TaskOutcome::completed(format!("x = {}", total))
    }
}

/// Asks the "advisor" role for a threshold before finishing.
struct Asker;

#[async_trait]
impl Worker for Asker {
    fn role(&self) -> &str {
        "W1"
    }

    async fn execute(&self, _task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
        let outcome = ctx
            .ask(
                "advisor",
                "what is the evacuation threshold?",
                HashMap::new(),
                Duration::from_secs(2),
            )
            .await;
        match outcome {
            Ok(CollaborationOutcome::Responded(payload)) => {
                TaskOutcome::completed(format!("threshold {}", payload["threshold"]))
            }
            Ok(other) => TaskOutcome::failed(format!("no advice: {:?}", other)),
            Err(e) => TaskOutcome::failed(e.to_string()),
        }
    }
}

struct Failing(&'static str);

#[async_trait]
impl Worker for Failing {
    fn role(&self) -> &str {
        self.0
    }

    async fn execute(&self, _task: TaskDescriptor, _ctx: WorkerContext) -> TaskOutcome {
        TaskOutcome::failed("sensor offline")
    }
}

struct Succeeding(&'static str);

#[async_trait]
impl Worker for Succeeding {
    fn role(&self) -> &str {
        self.0
    }

    async fn execute(&self, task: TaskDescriptor, _ctx: WorkerContext) -> TaskOutcome {
        TaskOutcome::completed(format!("{} ok", task.name))
    }
}

fn engine_with(templates: &[&str]) -> Engine {
    let registry = TemplateRegistry::new();
    for yaml in templates {
        registry.register(PlanTemplate::from_yaml(yaml).unwrap()).unwrap();
    }
    let config = EngineConfig {
        driver_tick_ms: 20,
        ..EngineConfig::default()
    };
    Engine::new(config, registry, Arc::new(MemoryArtifactStore::new()))
}

#[tokio::test]
async fn test_two_step_two_task_end_to_end() {
    let engine = engine_with(&[TWO_STEP_TWO_TASK]);
    engine.workers().register(Arc::new(Collector)).unwrap();
    engine.workers().register(Arc::new(Analyst)).unwrap();
    let observer = engine.subscribe("test-dashboard");

    let plan_id = engine
        .create_plan("two-step-two-task", "1.0", HashMap::new())
        .unwrap();
    let task1 = format!("{}_step1_task1", plan_id);
    let task2 = format!("{}_step2_task2", plan_id);

    let ready: Vec<String> = engine
        .get_ready_tasks(&plan_id)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![task1.clone()]);

    let report = engine.run_plan(&plan_id).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.artifacts, vec![format!("tasks/{}/out", task1)]);
    assert_eq!(
        engine.get_task(&task2).unwrap().result_summary.as_deref(),
        Some("x = 1")
    );

    let status = engine.get_plan_status(&plan_id).unwrap();
    assert_eq!(status.completed_task_count, 2);
    assert_eq!(status.total_task_count, 2);

    // Per-task transitions arrive in order.
    let mut seen: Vec<(String, TaskStatus)> = Vec::new();
    while let Some(event) = observer.try_recv() {
        seen.push((event.task_id, event.new_status));
    }
    let task2_events: Vec<TaskStatus> = seen
        .iter()
        .filter(|(id, _)| *id == task2)
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(
        task2_events,
        vec![TaskStatus::Ready, TaskStatus::InProgress, TaskStatus::Completed]
    );
    assert_eq!(observer.dropped_events(), 0);
}

#[tokio::test]
async fn test_worker_collaborates_mid_task() {
    let engine = engine_with(&[r#"
name: ask
steps:
  - id: s
    tasks:
      - { id: t, name: T, assignee: W1 }
"#]);
    engine.workers().register(Arc::new(Asker)).unwrap();

    let mut inbox = engine.broker().register_inbox("advisor").unwrap();
    let broker = engine.broker().clone();
    let advisor = tokio::spawn(async move {
        let request = inbox.recv().await.unwrap();
        assert_eq!(request.requester, "W1");
        broker
            .respond(&request.id, serde_json::json!({"threshold": 3}))
            .unwrap();
    });

    let plan_id = engine.create_plan("ask", "1.0", HashMap::new()).unwrap();
    let report = engine.run_plan(&plan_id).await.unwrap();
    advisor.await.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.tasks[0].result_summary.as_deref(), Some("threshold 3"));
}

#[tokio::test]
async fn test_partial_failure_keeps_unrelated_work() {
    let engine = engine_with(&[r#"
name: partial
step_barrier: false
steps:
  - id: s1
    tasks:
      - { id: broken, name: Broken, assignee: flaky, output_artifacts: [feed] }
      - { id: healthy, name: Healthy, assignee: steady }
  - id: s2
    tasks:
      - { id: consumer, name: Consumer, assignee: steady, input_artifacts: [feed] }
"#]);
    engine.workers().register(Arc::new(Failing("flaky"))).unwrap();
    engine.workers().register(Arc::new(Succeeding("steady"))).unwrap();

    let plan_id = engine.create_plan("partial", "1.0", HashMap::new()).unwrap();
    let report = engine.run_plan(&plan_id).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.failure_reason, Some(FailureReason::TaskError));
    let status_of = |id: &str| {
        report
            .tasks
            .iter()
            .find(|t| t.template_task_id == id)
            .map(|t| t.status)
    };
    assert_eq!(status_of("broken"), Some(TaskStatus::Error));
    assert_eq!(status_of("healthy"), Some(TaskStatus::Completed));
    assert_eq!(status_of("consumer"), Some(TaskStatus::Skipped));
}

#[tokio::test]
async fn test_blocking_failure_skips_remaining_tasks() {
    let engine = engine_with(&[r#"
name: blocking
steps:
  - id: s1
    tasks:
      - { id: gate, name: Gate, assignee: flaky, blocking: true }
  - id: s2
    tasks:
      - { id: a, name: A, assignee: steady }
      - { id: b, name: B, assignee: steady }
"#]);
    engine.workers().register(Arc::new(Failing("flaky"))).unwrap();
    engine.workers().register(Arc::new(Succeeding("steady"))).unwrap();

    let plan_id = engine.create_plan("blocking", "1.0", HashMap::new()).unwrap();
    let report = engine.run_plan(&plan_id).await.unwrap();

    assert_eq!(report.failure_reason, Some(FailureReason::BlockingTaskError));
    assert_eq!(report.count_with_status(TaskStatus::Skipped), 2);
}

#[tokio::test]
async fn test_priority_order_of_ready_tasks() {
    let engine = engine_with(&[r#"
name: priorities
steps:
  - id: s
    tasks:
      - { id: crit, name: C, assignee: w, priority: critical }
      - { id: norm, name: N, assignee: w, priority: normal }
      - { id: high, name: H, assignee: w, priority: high }
"#]);
    let plan_id = engine.create_plan("priorities", "1.0", HashMap::new()).unwrap();
    let order: Vec<String> = engine
        .get_ready_tasks(&plan_id)
        .unwrap()
        .into_iter()
        .map(|t| t.template_task_id)
        .collect();
    assert_eq!(order, vec!["crit", "high", "norm"]);
}

#[tokio::test]
async fn test_external_updates_without_driver() {
    let engine = engine_with(&[TWO_STEP_TWO_TASK]);
    let plan_id = engine
        .create_plan("two-step-two-task", "1.0", HashMap::new())
        .unwrap();
    let task1 = format!("{}_step1_task1", plan_id);
    let task2 = format!("{}_step2_task2", plan_id);

    engine.update_task_status(&task1, TaskStatus::InProgress, None).unwrap();
    assert!(engine.get_ready_tasks(&plan_id).unwrap().is_empty());
    engine
        .update_task_status(&task1, TaskStatus::Completed, None)
        .unwrap();
    assert_eq!(engine.get_ready_tasks(&plan_id).unwrap()[0].id, task2);

    engine.update_task_status(&task2, TaskStatus::InProgress, None).unwrap();
    engine
        .update_task_status(&task2, TaskStatus::Error, Some("model diverged".into()))
        .unwrap();
    let status = engine.get_plan_status(&plan_id).unwrap();
    assert_eq!(status.status, PlanStatus::Failed);
    assert_eq!(status.completed_task_count, 1);
}

#[tokio::test]
async fn test_sqlite_artifacts_survive_engine() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("muster.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let registry = TemplateRegistry::new();
    registry
        .register(PlanTemplate::from_yaml(TWO_STEP_TWO_TASK).unwrap())
        .unwrap();
    let engine = Engine::new(
        EngineConfig::default(),
        registry,
        Arc::new(SqliteArtifactStore::open(&db_path).unwrap()),
    );
    engine.workers().register(Arc::new(Collector)).unwrap();
    engine.workers().register(Arc::new(Analyst)).unwrap();

    let plan_id = engine
        .create_plan("two-step-two-task", "1.0", HashMap::new())
        .unwrap();
    let report = engine.run_plan(&plan_id).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    drop(engine);

    use muster_core::ArtifactStore;
    let reopened = SqliteArtifactStore::open(&db_path).unwrap();
    let keys = reopened
        .list(&muster_core::models::plan_artifact_prefix(&plan_id))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
}
