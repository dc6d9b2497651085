//! Plan Instance Store: in-memory truth about every running plan.
//!
//! Each plan lives behind its own mutex: all mutations of one plan's task
//! table are serialized, and reads take the same lock so they always see a
//! consistent snapshot. Plans never share a lock with each other.

use chrono::Utc;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use tokio::sync::watch;

use crate::error::{EngineError, Result};
use crate::events::{ProgressEvent, ProgressPublisher};
use crate::models::artifact::artifact_key;
use crate::models::plan::{
    Dependency, FailureReason, PlanInstance, PlanProgress, PlanStatus,
};
use crate::models::task::{TaskState, TaskStatus};
use crate::workflow::resolver::{
    self, build_dependency_graph, dependencies_broken, dependencies_satisfied,
};
use crate::workflow::schema::PlanTemplate;

struct PlanSlot {
    plan: Mutex<PlanInstance>,
    /// Bumped after every mutation so driver loops can wait for changes.
    version: watch::Sender<u64>,
}

impl PlanSlot {
    fn lock(&self) -> Result<MutexGuard<'_, PlanInstance>> {
        self.plan.lock().map_err(|_| EngineError::lock_poisoned("plan"))
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// A status change applied while holding the plan lock.
struct Transition {
    task_id: String,
    from: TaskStatus,
    to: TaskStatus,
    summary: Option<String>,
}

pub struct PlanStore {
    plans: RwLock<HashMap<String, Arc<PlanSlot>>>,
    /// Task id → plan id
    task_index: RwLock<HashMap<String, String>>,
    publisher: ProgressPublisher,
}

impl PlanStore {
    pub fn new(publisher: ProgressPublisher) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
            publisher,
        }
    }

    /// Expand a template into a new running plan and return its id.
    ///
    /// Tasks without dependencies start `ready`; the rest start `pending`
    /// and are released as their producers complete. Nothing is stored when
    /// the template is rejected.
    pub fn create_plan(
        &self,
        template: &PlanTemplate,
        initial_context: HashMap<String, serde_json::Value>,
    ) -> Result<String> {
        let graph = build_dependency_graph(template)?;

        let plan_id = format!("plan-{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();

        let full_ids: HashMap<&str, String> = template
            .tasks()
            .map(|(step, task)| {
                (
                    task.id.as_str(),
                    TaskState::task_id(&plan_id, &step.id, &task.id),
                )
            })
            .collect();
        let full_id = |template_id: &str| -> Result<String> {
            full_ids.get(template_id).cloned().ok_or_else(|| {
                EngineError::Internal(format!("unindexed template task '{}'", template_id))
            })
        };

        let mut tasks = Vec::with_capacity(template.task_count());
        let mut upstream: HashMap<String, Vec<Dependency>> = HashMap::new();
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();

        for (sequence, (step, task)) in template.tasks().enumerate() {
            let task_id = full_id(&task.id)?;

            let mut deps = Vec::new();
            for (upstream_id, kind) in graph.upstream_of(&task.id) {
                let upstream_full = full_id(&upstream_id)?;
                downstream
                    .entry(upstream_full.clone())
                    .or_default()
                    .push(task_id.clone());
                deps.push(Dependency {
                    task_id: upstream_full,
                    kind,
                });
            }

            let mut input_artifacts = Vec::with_capacity(task.input_artifacts.len());
            for input in &task.input_artifacts {
                let producer = graph.producers.get(input).ok_or_else(|| {
                    EngineError::InvalidTemplate(format!("no producer for '{}'", input))
                })?;
                input_artifacts.push(artifact_key(&full_id(producer)?, input));
            }

            tasks.push(TaskState {
                id: task_id.clone(),
                plan_id: plan_id.clone(),
                step_id: step.id.clone(),
                template_task_id: task.id.clone(),
                name: task.name.clone(),
                assignee: task.assignee.clone(),
                description: resolve_context(&task.description, &initial_context),
                priority: task.priority,
                status: if deps.is_empty() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Pending
                },
                result_summary: None,
                input_artifacts,
                output_artifacts: task
                    .output_artifacts
                    .iter()
                    .map(|name| artifact_key(&task_id, name))
                    .collect(),
                timeout_seconds: task.timeout_seconds,
                blocking: task.blocking,
                sequence,
                created_at: now,
                updated_at: now,
            });
            upstream.insert(task_id, deps);
        }

        let steps = template
            .steps
            .iter()
            .map(|step| {
                let ids = step
                    .tasks
                    .iter()
                    .filter_map(|t| full_ids.get(t.id.as_str()).cloned())
                    .collect();
                (step.id.clone(), ids)
            })
            .collect();

        let plan = PlanInstance {
            id: plan_id.clone(),
            template_name: template.name.clone(),
            template_version: template.version.clone(),
            status: PlanStatus::Running,
            failure_reason: None,
            initial_context,
            tasks,
            steps,
            upstream,
            downstream,
            created_at: now,
            updated_at: now,
        };

        let task_ids: Vec<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        let (version, _) = watch::channel(0);
        self.plans
            .write()
            .map_err(|_| EngineError::lock_poisoned("plan table"))?
            .insert(
                plan_id.clone(),
                Arc::new(PlanSlot {
                    plan: Mutex::new(plan),
                    version,
                }),
            );
        {
            let mut index = self
                .task_index
                .write()
                .map_err(|_| EngineError::lock_poisoned("task index"))?;
            for task_id in task_ids {
                index.insert(task_id, plan_id.clone());
            }
        }

        tracing::info!(
            "[PlanStore] Created plan {} from template {}@{} ({} tasks)",
            plan_id,
            template.name,
            template.version,
            template.task_count()
        );
        Ok(plan_id)
    }

    /// Apply a caller-requested status change.
    ///
    /// Only forward transitions are accepted; anything else fails with
    /// `InvalidTransition` and leaves the plan untouched. A successful
    /// change may release or skip dependent tasks and settle the plan.
    pub fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        summary: Option<String>,
    ) -> Result<TaskState> {
        let slot = self.slot_for_task(task_id)?;
        let mut plan = slot.lock()?;

        let current = plan
            .task(task_id)
            .map(|t| t.status)
            .ok_or_else(|| EngineError::NotFound(format!("Task not found: {}", task_id)))?;
        if !current.allows(new_status) {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: new_status,
            });
        }

        let mut transitions = Vec::new();
        set_status(&mut plan, task_id, new_status, summary, &mut transitions);

        let blocking_failure = new_status == TaskStatus::Error
            && plan.task(task_id).map(|t| t.blocking).unwrap_or(false);
        if blocking_failure {
            tracing::warn!(
                "[PlanStore] Blocking task {} failed; skipping remaining tasks of plan {}",
                task_id,
                plan.id
            );
            skip_unstarted(&mut plan, "skipped: blocking task failed", &mut transitions);
        } else {
            propagate(&mut plan, task_id, &mut transitions);
        }

        if plan.status == PlanStatus::Running {
            if new_status == TaskStatus::Error {
                plan.status = PlanStatus::Failed;
                plan.failure_reason = Some(if blocking_failure {
                    FailureReason::BlockingTaskError
                } else {
                    FailureReason::TaskError
                });
                tracing::warn!("[PlanStore] Plan {} failed: task {} errored", plan.id, task_id);
            } else if plan
                .tasks
                .iter()
                .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped))
            {
                plan.status = PlanStatus::Completed;
                tracing::info!("[PlanStore] Plan {} completed", plan.id);
            }
        }
        plan.updated_at = Utc::now();

        self.publish(&plan, transitions);
        let updated = plan
            .task(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Task not found: {}", task_id)))?;
        drop(plan);
        slot.bump();
        Ok(updated)
    }

    /// Skip every task that has not started and fail the plan with reason
    /// `cancelled`. Tasks already `inprogress` are left alone.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<PlanProgress> {
        let slot = self.slot(plan_id)?;
        let mut plan = slot.lock()?;

        let mut transitions = Vec::new();
        skip_unstarted(&mut plan, "skipped: plan cancelled", &mut transitions);
        if plan.status == PlanStatus::Running {
            plan.status = PlanStatus::Failed;
            plan.failure_reason = Some(FailureReason::Cancelled);
        }
        plan.updated_at = Utc::now();
        tracing::info!(
            "[PlanStore] Cancelled plan {} ({} task(s) skipped)",
            plan_id,
            transitions.len()
        );

        self.publish(&plan, transitions);
        let progress = plan.progress();
        drop(plan);
        slot.bump();
        Ok(progress)
    }

    pub fn get_task(&self, task_id: &str) -> Result<TaskState> {
        let slot = self.slot_for_task(task_id)?;
        let plan = slot.lock()?;
        plan.task(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Task not found: {}", task_id)))
    }

    /// All tasks of a plan in template order.
    pub fn list_tasks(&self, plan_id: &str) -> Result<Vec<TaskState>> {
        let slot = self.slot(plan_id)?;
        let plan = slot.lock()?;
        Ok(plan.tasks.clone())
    }

    pub fn get_plan_status(&self, plan_id: &str) -> Result<PlanProgress> {
        let slot = self.slot(plan_id)?;
        let plan = slot.lock()?;
        Ok(plan.progress())
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<PlanInstance> {
        let slot = self.slot(plan_id)?;
        let plan = slot.lock()?;
        Ok(plan.clone())
    }

    /// Ready tasks of a plan, most urgent first.
    pub fn ready_tasks(&self, plan_id: &str) -> Result<Vec<TaskState>> {
        let slot = self.slot(plan_id)?;
        let plan = slot.lock()?;
        Ok(resolver::ready_tasks(&plan))
    }

    pub fn list_plans(&self) -> Result<Vec<PlanProgress>> {
        let slots: Vec<Arc<PlanSlot>> = self
            .plans
            .read()
            .map_err(|_| EngineError::lock_poisoned("plan table"))?
            .values()
            .cloned()
            .collect();
        let mut plans = Vec::with_capacity(slots.len());
        for slot in slots {
            plans.push(slot.lock()?.progress());
        }
        plans.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        Ok(plans)
    }

    /// Receiver that changes after every mutation of the plan.
    pub fn watch_plan(&self, plan_id: &str) -> Result<watch::Receiver<u64>> {
        Ok(self.slot(plan_id)?.version.subscribe())
    }

    /// Forget a finished plan. Running plans cannot be removed.
    pub fn remove_plan(&self, plan_id: &str) -> Result<PlanInstance> {
        let plan = self.get_plan(plan_id)?;
        if !plan.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "Plan {} is still running",
                plan_id
            )));
        }
        self.plans
            .write()
            .map_err(|_| EngineError::lock_poisoned("plan table"))?
            .remove(plan_id);
        if let Ok(mut index) = self.task_index.write() {
            index.retain(|_, owner| owner != plan_id);
        }
        tracing::debug!("[PlanStore] Removed plan {}", plan_id);
        Ok(plan)
    }

    fn slot(&self, plan_id: &str) -> Result<Arc<PlanSlot>> {
        self.plans
            .read()
            .map_err(|_| EngineError::lock_poisoned("plan table"))?
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Plan not found: {}", plan_id)))
    }

    fn slot_for_task(&self, task_id: &str) -> Result<Arc<PlanSlot>> {
        let plan_id = self
            .task_index
            .read()
            .map_err(|_| EngineError::lock_poisoned("task index"))?
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Task not found: {}", task_id)))?;
        self.slot(&plan_id)
    }

    fn publish(&self, plan: &PlanInstance, transitions: Vec<Transition>) {
        let timestamp = plan.updated_at;
        for t in transitions {
            self.publisher.publish(ProgressEvent {
                plan_id: plan.id.clone(),
                task_id: t.task_id,
                old_status: t.from,
                new_status: t.to,
                plan_status: plan.status,
                summary: t.summary,
                timestamp,
            });
        }
    }
}

fn set_status(
    plan: &mut PlanInstance,
    task_id: &str,
    status: TaskStatus,
    summary: Option<String>,
    transitions: &mut Vec<Transition>,
) {
    if let Some(task) = plan.task_mut(task_id) {
        let from = task.status;
        task.status = status;
        if summary.is_some() {
            task.result_summary = summary.clone();
        }
        task.updated_at = Utc::now();
        transitions.push(Transition {
            task_id: task_id.to_string(),
            from,
            to: status,
            summary,
        });
    }
}

/// Walk the dependents of `changed`: release pending tasks whose
/// dependencies are met and skip the ones whose dependencies can no longer
/// be met. A skipped task's own dependents are revisited in turn.
fn propagate(plan: &mut PlanInstance, changed: &str, transitions: &mut Vec<Transition>) {
    let mut queue: VecDeque<String> = plan
        .downstream
        .get(changed)
        .cloned()
        .unwrap_or_default()
        .into();

    while let Some(task_id) = queue.pop_front() {
        if plan.task(&task_id).map(|t| t.status) != Some(TaskStatus::Pending) {
            continue;
        }
        if dependencies_broken(plan, &task_id) {
            set_status(
                plan,
                &task_id,
                TaskStatus::Skipped,
                Some("skipped: upstream task did not complete".to_string()),
                transitions,
            );
            if let Some(next) = plan.downstream.get(&task_id) {
                queue.extend(next.iter().cloned());
            }
        } else if dependencies_satisfied(plan, &task_id) {
            set_status(plan, &task_id, TaskStatus::Ready, None, transitions);
        }
    }
}

fn skip_unstarted(plan: &mut PlanInstance, reason: &str, transitions: &mut Vec<Transition>) {
    let unstarted: Vec<String> = plan
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Pending))
        .map(|t| t.id.clone())
        .collect();
    for task_id in unstarted {
        set_status(
            plan,
            &task_id,
            TaskStatus::Skipped,
            Some(reason.to_string()),
            transitions,
        );
    }
}

/// Substitute `${context.<key>}` references from the plan's initial context.
/// Unknown keys are left untouched.
fn resolve_context(template: &str, context: &HashMap<String, serde_json::Value>) -> String {
    static CONTEXT_RE: OnceLock<Regex> = OnceLock::new();
    let re = CONTEXT_RE.get_or_init(|| {
        Regex::new(r"\$\{context\.([^}]+)\}").expect("context pattern is a valid regex")
    });
    re.replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match context.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    })
    .to_string()
}
