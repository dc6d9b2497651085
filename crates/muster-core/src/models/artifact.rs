use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// A stored work product, addressed by a hierarchical key such as
/// `tasks/{task_id}/report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub key: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(key: String, content: Vec<u8>, content_type: String) -> Self {
        Self {
            key,
            content,
            content_type,
            updated_at: Utc::now(),
        }
    }
}

/// Key under which `task_id` stores its artifact `name`.
pub fn artifact_key(task_id: &str, name: &str) -> String {
    format!("tasks/{}/{}", task_id, name)
}

/// Prefix that enumerates every artifact produced by a plan's tasks.
pub fn plan_artifact_prefix(plan_id: &str) -> String {
    format!("tasks/{}_", plan_id)
}
