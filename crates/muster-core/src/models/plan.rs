use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::task::{TaskState, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a plan ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    TaskError,
    BlockingTaskError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::TaskError => "task_error",
            Self::BlockingTaskError => "blocking_task_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running instantiation of a plan template.
///
/// Owned by the plan store; `steps` and the dependency maps are fixed at
/// instantiation and never change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInstance {
    pub id: String,
    pub template_name: String,
    pub template_version: String,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub initial_context: HashMap<String, serde_json::Value>,
    /// Tasks in template order.
    pub tasks: Vec<TaskState>,
    /// Step id → task ids, in template order.
    pub steps: Vec<(String, Vec<String>)>,
    /// Task id → what it waits on.
    #[serde(default)]
    pub upstream: HashMap<String, Vec<Dependency>>,
    /// Task id → ids of tasks waiting on it.
    #[serde(default)]
    pub downstream: HashMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanInstance {
    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub(crate) fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskState> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn progress(&self) -> PlanProgress {
        PlanProgress {
            plan_id: self.id.clone(),
            status: self.status,
            failure_reason: self.failure_reason,
            completed_task_count: self.count_with_status(TaskStatus::Completed),
            total_task_count: self.tasks.len(),
        }
    }
}

/// Why one task waits on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The downstream task consumes an artifact the upstream task produces.
    Artifact,
    /// The upstream task belongs to an earlier step (step barrier).
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub task_id: String,
    pub kind: DependencyKind,
}

impl Dependency {
    /// Whether an upstream task in `status` releases this dependency.
    pub fn is_satisfied_by(&self, status: TaskStatus) -> bool {
        match self.kind {
            DependencyKind::Artifact => status == TaskStatus::Completed,
            DependencyKind::Step => matches!(status, TaskStatus::Completed | TaskStatus::Skipped),
        }
    }

    /// Whether an upstream task in `status` can never release this dependency.
    pub fn is_broken_by(&self, status: TaskStatus) -> bool {
        match self.kind {
            DependencyKind::Artifact => matches!(status, TaskStatus::Error | TaskStatus::Skipped),
            DependencyKind::Step => status == TaskStatus::Error,
        }
    }
}

/// Snapshot returned by `get_plan_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    pub plan_id: String,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub completed_task_count: usize,
    pub total_task_count: usize,
}
