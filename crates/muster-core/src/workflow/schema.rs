//! YAML schema types for SOP plan templates.
//!
//! A template document defines an ordered list of steps, each made of
//! tasks owned by a worker role:
//!
//! ```yaml
//! name: "flood-response"
//! version: "1.0"
//! description: "Initial assessment and resource dispatch for a flood"
//!
//! steps:
//!   - id: assess
//!     name: "Situation assessment"
//!     tasks:
//!       - id: hazard
//!         name: "Hazard analysis"
//!         assignee: "hazard-analyst"
//!         description: "Assess flood extent around ${context.location}"
//!         priority: critical
//!         timeout_seconds: 120
//!         output_artifacts: [hazard_report]
//!
//!   - id: plan
//!     name: "Resource planning"
//!     tasks:
//!       - id: resources
//!         name: "Resource allocation"
//!         assignee: "resource-planner"
//!         priority: high
//!         input_artifacts: [hazard_report]
//!         output_artifacts: [allocation]
//!         blocking: true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::task::Priority;

/// Top-level plan template loaded from a YAML (or JSON) document.
/// Read-only to the engine once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    /// When set, every task waits for all tasks of earlier steps to finish
    /// in addition to its declared inputs.
    #[serde(default = "default_step_barrier")]
    pub step_barrier: bool,

    /// Ordered list of steps
    pub steps: Vec<StepTemplate>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_step_barrier() -> bool {
    true
}

/// One step of the SOP: an ordered group of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub tasks: Vec<TaskTemplate>,
}

impl StepTemplate {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A single assignable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Unique within the template
    pub id: String,

    pub name: String,

    /// Worker role that owns this task
    pub assignee: String,

    /// Instructions for the worker; `${context.<key>}` is substituted from
    /// the plan's initial context at instantiation.
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Artifact names consumed; each must be produced by exactly one task.
    #[serde(default)]
    pub input_artifacts: Vec<String>,

    /// Artifact names produced
    #[serde(default)]
    pub output_artifacts: Vec<String>,

    /// A failure of a blocking task skips every task that has not started.
    #[serde(default)]
    pub blocking: bool,
}

impl PlanTemplate {
    /// Parse a template from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::InvalidTemplate(format!("Failed to parse template YAML: {}", e)))
    }

    /// Parse a template from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidTemplate(format!("Failed to parse template JSON: {}", e)))
    }

    /// Load a template from a file; `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read template file '{}': {}", path, e)))?;
        if path.ends_with(".json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn task_count(&self) -> usize {
        self.steps.iter().map(|s| s.tasks.len()).sum()
    }

    /// Iterate `(step, task)` pairs in template order.
    pub fn tasks(&self) -> impl Iterator<Item = (&StepTemplate, &TaskTemplate)> {
        self.steps
            .iter()
            .flat_map(|step| step.tasks.iter().map(move |task| (step, task)))
    }
}
