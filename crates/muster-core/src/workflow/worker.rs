//! Worker contract: how the engine hands tasks to analysis roles.
//!
//! A role is served either by a local [`Worker`] that the driver runs on
//! the plan's runtime, or by a remote process that receives a one-time
//! activation and reports back through the engine's status API.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::collaboration::{CollaborationBroker, CollaborationOutcome};
use crate::error::{EngineError, Result};
use crate::models::artifact::{artifact_key, DEFAULT_CONTENT_TYPE};
use crate::models::task::{Priority, TaskState};
use crate::store::artifact_store::ArtifactStore;

/// What a worker is told about its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub plan_id: String,
    pub task_id: String,
    pub name: String,
    pub assignee: String,
    pub description: String,
    pub priority: Priority,
    /// Artifact keys to read
    pub input_artifacts: Vec<String>,
    /// Artifact keys to write
    pub output_artifacts: Vec<String>,
    pub timeout: Duration,
}

impl TaskDescriptor {
    pub fn from_task(task: &TaskState, default_timeout: Duration) -> Self {
        Self {
            plan_id: task.plan_id.clone(),
            task_id: task.id.clone(),
            name: task.name.clone(),
            assignee: task.assignee.clone(),
            description: task.description.clone(),
            priority: task.priority,
            input_artifacts: task.input_artifacts.clone(),
            output_artifacts: task.output_artifacts.clone(),
            timeout: task
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        }
    }
}

/// How a local worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { summary: String },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn completed(summary: impl Into<String>) -> Self {
        Self::Completed {
            summary: summary.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl<E: fmt::Display> From<std::result::Result<String, E>> for TaskOutcome {
    fn from(result: std::result::Result<String, E>) -> Self {
        match result {
            Ok(summary) => Self::completed(summary),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// An analysis role executed in-process.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Role name matched against a task's `assignee`.
    fn role(&self) -> &str;

    async fn execute(&self, task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome;
}

/// Handles a worker gets for the duration of one task.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: String,
    plan_id: String,
    role: String,
    artifacts: Arc<dyn ArtifactStore>,
    broker: CollaborationBroker,
    cancel: CancellationToken,
    heartbeat: Arc<watch::Sender<u64>>,
}

impl WorkerContext {
    pub fn new(
        task: &TaskDescriptor,
        artifacts: Arc<dyn ArtifactStore>,
        broker: CollaborationBroker,
        cancel: CancellationToken,
        heartbeat: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            plan_id: task.plan_id.clone(),
            role: task.assignee.clone(),
            artifacts,
            broker,
            cancel,
            heartbeat,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Push the task deadline out by another full timeout.
    pub fn heartbeat(&self) {
        self.heartbeat.send_modify(|beats| *beats += 1);
    }

    /// Fires when the plan is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn broker(&self) -> &CollaborationBroker {
        &self.broker
    }

    /// Store an output under this task's key prefix and return its key.
    pub async fn save_output(
        &self,
        name: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let key = artifact_key(&self.task_id, name);
        self.artifacts.save(&key, content, content_type).await?;
        Ok(key)
    }

    pub async fn save_json<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<String> {
        let content = serde_json::to_vec(value)
            .map_err(|e| EngineError::Internal(format!("Failed to encode artifact: {}", e)))?;
        self.save_output(name, content, DEFAULT_CONTENT_TYPE).await
    }

    pub async fn load_input(&self, key: &str, content_type: &str) -> Result<Vec<u8>> {
        self.artifacts.load(key, content_type).await
    }

    pub async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let content = self.load_input(key, DEFAULT_CONTENT_TYPE).await?;
        serde_json::from_slice(&content)
            .map_err(|e| EngineError::Internal(format!("Failed to decode artifact {}: {}", key, e)))
    }

    /// Ask another role for help and wait for the answer, the timeout, or
    /// plan cancellation.
    pub async fn ask(
        &self,
        target: &str,
        description: &str,
        context: HashMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> Result<CollaborationOutcome> {
        let request_id = self
            .broker
            .submit(&self.role, target, description, context, timeout)?;
        self.broker
            .await_response(&request_id, timeout, &self.cancel)
            .await
    }
}

/// Where the driver sends a task of a given role.
#[derive(Clone)]
pub enum Assignment {
    Local(Arc<dyn Worker>),
    Remote(mpsc::UnboundedSender<TaskDescriptor>),
    Unassigned,
}

/// Role → worker lookup table.
#[derive(Default)]
pub struct WorkerRegistry {
    local: RwLock<HashMap<String, Arc<dyn Worker>>>,
    remote: RwLock<HashMap<String, mpsc::UnboundedSender<TaskDescriptor>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `worker.role()` in-process. Replaces any earlier registration
    /// of the same role.
    pub fn register(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let role = worker.role().to_string();
        self.remote
            .write()
            .map_err(|_| EngineError::lock_poisoned("worker registry"))?
            .remove(&role);
        self.local
            .write()
            .map_err(|_| EngineError::lock_poisoned("worker registry"))?
            .insert(role.clone(), worker);
        tracing::info!("[Workers] Local worker registered for role '{}'", role);
        Ok(())
    }

    /// Serve `role` out of process. Ready tasks of that role are sent once
    /// on the returned receiver; the remote side reports progress through
    /// the engine.
    pub fn register_remote(&self, role: &str) -> Result<mpsc::UnboundedReceiver<TaskDescriptor>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local
            .write()
            .map_err(|_| EngineError::lock_poisoned("worker registry"))?
            .remove(role);
        self.remote
            .write()
            .map_err(|_| EngineError::lock_poisoned("worker registry"))?
            .insert(role.to_string(), tx);
        tracing::info!("[Workers] Remote role registered: '{}'", role);
        Ok(rx)
    }

    pub fn lookup(&self, role: &str) -> Assignment {
        if let Some(worker) = self.local.read().ok().and_then(|l| l.get(role).cloned()) {
            return Assignment::Local(worker);
        }
        match self.remote.read().ok().and_then(|r| r.get(role).cloned()) {
            Some(tx) => Assignment::Remote(tx),
            None => Assignment::Unassigned,
        }
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .local
            .read()
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default();
        if let Ok(remote) = self.remote.read() {
            roles.extend(remote.keys().cloned());
        }
        roles.sort();
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::artifact_store::MemoryArtifactStore;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        fn role(&self) -> &str {
            "echo"
        }

        async fn execute(&self, task: TaskDescriptor, _ctx: WorkerContext) -> TaskOutcome {
            TaskOutcome::completed(task.name)
        }
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            plan_id: "plan-1".to_string(),
            task_id: "plan-1_s_t".to_string(),
            name: "t".to_string(),
            assignee: "echo".to_string(),
            description: String::new(),
            priority: Priority::Normal,
            input_artifacts: vec![],
            output_artifacts: vec![],
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_registry_lookup_local_then_remote() {
        let registry = WorkerRegistry::new();
        assert!(matches!(registry.lookup("echo"), Assignment::Unassigned));

        let _rx = registry.register_remote("echo").unwrap();
        assert!(matches!(registry.lookup("echo"), Assignment::Remote(_)));

        registry.register(Arc::new(Echo)).unwrap();
        assert!(matches!(registry.lookup("echo"), Assignment::Local(_)));
        assert_eq!(registry.roles(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: std::result::Result<String, EngineError> = Ok("fine".to_string());
        assert_eq!(TaskOutcome::from(ok), TaskOutcome::completed("fine"));
        let err: std::result::Result<String, EngineError> =
            Err(EngineError::Storage("disk full".to_string()));
        assert_eq!(
            TaskOutcome::from(err),
            TaskOutcome::failed("Storage error: disk full")
        );
    }

    #[tokio::test]
    async fn test_context_saves_under_task_prefix() {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let (heartbeat, rx) = watch::channel(0);
        let ctx = WorkerContext::new(
            &descriptor(),
            artifacts.clone(),
            CollaborationBroker::new(),
            CancellationToken::new(),
            Arc::new(heartbeat),
        );

        let key = ctx
            .save_json("report", &serde_json::json!({"level": 2}))
            .await
            .unwrap();
        assert_eq!(key, "tasks/plan-1_s_t/report");
        let value: serde_json::Value = ctx.load_json(&key).await.unwrap();
        assert_eq!(value["level"], 2);

        ctx.heartbeat();
        assert_eq!(*rx.borrow(), 1);
    }
}
