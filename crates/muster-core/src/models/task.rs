use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single task inside a plan.
///
/// `Pending` is the store's internal pre-ready marker for tasks whose
/// producers have not completed yet; it is never set by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "inprogress",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "inprogress" | "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Skipped)
    }

    /// Transitions a caller may request through `update_task_status`.
    ///
    /// `Pending -> Ready` and `Pending -> Skipped` are store-internal and
    /// therefore rejected here.
    pub fn allows(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Ready, Self::InProgress)
                | (Self::Ready, Self::Skipped)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Error)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Ordering is `Critical < High < Normal < Low`, so sorting
/// ascending yields the most urgent task first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "normal" | "medium" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete, mutable state of one task inside a running plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    /// `{plan_id}_{step_id}_{task_template_id}`
    pub id: String,
    pub plan_id: String,
    pub step_id: String,
    pub template_task_id: String,
    pub name: String,
    pub assignee: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    /// Artifact keys this task reads, resolved to their producers' keys.
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    /// Artifact keys this task is expected to write.
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub blocking: bool,
    /// Position in template order; tie-breaker for equal priorities.
    pub sequence: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn task_id(plan_id: &str, step_id: &str, template_task_id: &str) -> String {
        format!("{}_{}_{}", plan_id, step_id, template_task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(TaskStatus::Ready.allows(TaskStatus::InProgress));
        assert!(TaskStatus::Ready.allows(TaskStatus::Skipped));
        assert!(TaskStatus::InProgress.allows(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.allows(TaskStatus::Error));

        assert!(!TaskStatus::Completed.allows(TaskStatus::Ready));
        assert!(!TaskStatus::InProgress.allows(TaskStatus::Ready));
        assert!(!TaskStatus::InProgress.allows(TaskStatus::Skipped));
        assert!(!TaskStatus::Ready.allows(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.allows(TaskStatus::Ready));
        assert!(!TaskStatus::Skipped.allows(TaskStatus::InProgress));
    }

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Skipped,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
    }
}
