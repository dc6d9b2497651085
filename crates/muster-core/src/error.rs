//! Core error type for the Muster engine.
//!
//! `EngineError` is used throughout the core domain (stores, broker,
//! driver). Timeouts on collaboration waits are *not* errors; they are
//! reported as [`crate::collaboration::CollaborationOutcome::TimedOut`].

use crate::models::task::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Template rejected at plan creation: unresolved input, duplicate id,
    /// ambiguous producer, or dependency cycle.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Unknown collaboration request: {0}")]
    UnknownRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn lock_poisoned(what: &str) -> Self {
        EngineError::Internal(format!("{} lock poisoned", what))
    }
}
