//! Ready-task resolution and template dependency analysis.
//!
//! Dependencies are worked out once, when a plan is created
//! ([`build_dependency_graph`]). After that the hot path
//! ([`ready_tasks`]) only filters the plan's task table by status.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{EngineError, Result};
use crate::models::plan::{Dependency, DependencyKind, PlanInstance};
use crate::models::task::{TaskState, TaskStatus};
use crate::workflow::schema::PlanTemplate;

/// Dependencies between template tasks, keyed by template task id.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Task id → upstream task ids with the strongest dependency kind.
    pub upstream: HashMap<String, BTreeMap<String, DependencyKind>>,
    /// Artifact name → id of the only task producing it.
    pub producers: HashMap<String, String>,
}

impl DependencyGraph {
    pub fn upstream_of(&self, task_id: &str) -> Vec<(String, DependencyKind)> {
        self.upstream
            .get(task_id)
            .map(|deps| deps.iter().map(|(id, kind)| (id.clone(), *kind)).collect())
            .unwrap_or_default()
    }
}

/// Validate a template and derive its dependency graph.
///
/// Rejects empty templates, duplicate step or task ids (including step/task
/// pairs that flatten to the same plan task id), artifacts produced by more
/// than one task, inputs nobody produces, and cycles.
pub fn build_dependency_graph(template: &PlanTemplate) -> Result<DependencyGraph> {
    if template.name.trim().is_empty() {
        return Err(EngineError::InvalidTemplate("template name is empty".to_string()));
    }
    if template.task_count() == 0 {
        return Err(EngineError::InvalidTemplate(format!(
            "template '{}' declares no tasks",
            template.name
        )));
    }

    let mut step_ids = HashSet::new();
    let mut task_ids = HashSet::new();
    // Plan task ids are `{plan}_{step}_{task}`; distinct pairs must not
    // flatten to the same suffix.
    let mut qualified_ids: HashMap<String, (&str, &str)> = HashMap::new();
    let mut graph = DependencyGraph::default();

    for step in &template.steps {
        if step.id.trim().is_empty() {
            return Err(EngineError::InvalidTemplate("step with empty id".to_string()));
        }
        if !step_ids.insert(step.id.as_str()) {
            return Err(EngineError::InvalidTemplate(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if step.tasks.is_empty() {
            return Err(EngineError::InvalidTemplate(format!(
                "step '{}' has no tasks",
                step.id
            )));
        }
        for task in &step.tasks {
            if task.id.trim().is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "task with empty id in step '{}'",
                    step.id
                )));
            }
            if task.assignee.trim().is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "task '{}' has no assignee",
                    task.id
                )));
            }
            if !task_ids.insert(task.id.as_str()) {
                return Err(EngineError::InvalidTemplate(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            let qualified = format!("{}_{}", step.id, task.id);
            if let Some((other_step, other_task)) =
                qualified_ids.insert(qualified.clone(), (step.id.as_str(), task.id.as_str()))
            {
                return Err(EngineError::InvalidTemplate(format!(
                    "tasks '{}/{}' and '{}/{}' both resolve to id suffix '{}'",
                    other_step, other_task, step.id, task.id, qualified
                )));
            }
            graph.upstream.entry(task.id.clone()).or_default();
            for output in &task.output_artifacts {
                if let Some(existing) = graph.producers.get(output) {
                    if existing != &task.id {
                        return Err(EngineError::InvalidTemplate(format!(
                            "artifact '{}' is produced by both '{}' and '{}'",
                            output, existing, task.id
                        )));
                    }
                    continue;
                }
                graph.producers.insert(output.clone(), task.id.clone());
            }
        }
    }

    for (_, task) in template.tasks() {
        for input in &task.input_artifacts {
            let producer = graph.producers.get(input).ok_or_else(|| {
                EngineError::InvalidTemplate(format!(
                    "task '{}' consumes artifact '{}' which no task produces",
                    task.id, input
                ))
            })?;
            if producer == &task.id {
                return Err(EngineError::InvalidTemplate(format!(
                    "task '{}' consumes its own artifact '{}'",
                    task.id, input
                )));
            }
            let producer = producer.clone();
            if let Some(deps) = graph.upstream.get_mut(&task.id) {
                deps.insert(producer, DependencyKind::Artifact);
            }
        }
    }

    if template.step_barrier {
        for pair in template.steps.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            for task in &current.tasks {
                if let Some(deps) = graph.upstream.get_mut(&task.id) {
                    for earlier in &previous.tasks {
                        deps.entry(earlier.id.clone()).or_insert(DependencyKind::Step);
                    }
                }
            }
        }
    }

    detect_cycle(template, &graph)?;
    Ok(graph)
}

/// Kahn's algorithm over the dependency graph; anything left unvisited sits
/// on a cycle.
fn detect_cycle(template: &PlanTemplate, graph: &DependencyGraph) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task_id, deps) in &graph.upstream {
        in_degree.insert(task_id.as_str(), deps.len());
        for upstream in deps.keys() {
            dependents.entry(upstream.as_str()).or_default().push(task_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = template
        .tasks()
        .map(|(_, t)| t.id.as_str())
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut visited = 0;

    while let Some(task_id) = queue.pop_front() {
        visited += 1;
        for next in dependents.get(task_id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited == in_degree.len() {
        return Ok(());
    }

    let mut stuck: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();
    stuck.sort_unstable();
    Err(EngineError::InvalidTemplate(format!(
        "cyclic dependency between tasks: {}",
        stuck.join(", ")
    )))
}

/// Tasks currently `ready`, most urgent first; ties keep template order.
pub fn ready_tasks(plan: &PlanInstance) -> Vec<TaskState> {
    let mut ready: Vec<TaskState> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .cloned()
        .collect();
    ready.sort_by_key(|t| (t.priority, t.sequence));
    ready
}

/// Whether every dependency of `task_id` is released by its upstream task.
pub(crate) fn dependencies_satisfied(plan: &PlanInstance, task_id: &str) -> bool {
    plan.upstream
        .get(task_id)
        .map(|deps| {
            deps.iter()
                .all(|dep| upstream_status(plan, dep).is_some_and(|s| dep.is_satisfied_by(s)))
        })
        .unwrap_or(true)
}

/// Whether some dependency of `task_id` can never be released.
pub(crate) fn dependencies_broken(plan: &PlanInstance, task_id: &str) -> bool {
    plan.upstream
        .get(task_id)
        .map(|deps| {
            deps.iter()
                .any(|dep| upstream_status(plan, dep).is_some_and(|s| dep.is_broken_by(s)))
        })
        .unwrap_or(false)
}

fn upstream_status(plan: &PlanInstance, dep: &Dependency) -> Option<TaskStatus> {
    plan.task(&dep.task_id).map(|t| t.status)
}
