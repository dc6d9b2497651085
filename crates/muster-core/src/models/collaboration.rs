use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationStatus {
    Pending,
    Completed,
    Timeout,
}

impl CollaborationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
        }
    }
}

/// An out-of-band ask from one worker to another.
///
/// Once `status` leaves `Pending` the record is never modified again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationRequest {
    pub id: String,
    pub requester: String,
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub status: CollaborationStatus,
    pub created_at: DateTime<Utc>,
    /// After this instant an unanswered request is expired to `timeout`.
    pub deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl CollaborationRequest {
    pub fn new(
        requester: String,
        target: String,
        description: String,
        context: HashMap<String, serde_json::Value>,
        timeout: std::time::Duration,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester,
            target,
            description,
            context,
            status: CollaborationStatus::Pending,
            created_at,
            deadline,
            resolved_at: None,
            response: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CollaborationStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.deadline <= now
    }
}
