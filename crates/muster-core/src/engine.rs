//! Engine context: owns every shared service of the plan execution engine.
//!
//! There are no process globals: callers build one [`Engine`] and pass it
//! (usually as `Arc<Engine>`) to whatever drives plans or serves workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collaboration::{CollaborationBroker, CollaborationOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{ProgressPublisher, ProgressSubscription};
use crate::models::plan::{PlanInstance, PlanProgress};
use crate::models::task::{TaskState, TaskStatus};
use crate::store::artifact_store::{ArtifactStore, MemoryArtifactStore, SqliteArtifactStore};
use crate::store::plan_store::PlanStore;
use crate::workflow::driver::{DriverOptions, PlanDriver, PlanReport};
use crate::workflow::registry::TemplateRegistry;
use crate::workflow::worker::WorkerRegistry;

pub struct Engine {
    config: EngineConfig,
    templates: TemplateRegistry,
    plans: Arc<PlanStore>,
    broker: CollaborationBroker,
    publisher: ProgressPublisher,
    workers: Arc<WorkerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    cancellations: RwLock<HashMap<String, CancellationToken>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        templates: TemplateRegistry,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let publisher = ProgressPublisher::new(config.observer_queue_capacity);
        Self {
            plans: Arc::new(PlanStore::new(publisher.clone())),
            broker: CollaborationBroker::new(),
            workers: Arc::new(WorkerRegistry::new()),
            cancellations: RwLock::new(HashMap::new()),
            config,
            templates,
            publisher,
            artifacts,
        }
    }

    /// Build an engine from configuration alone: built-in templates plus the
    /// configured template directories, SQLite artifacts when a path is set.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let templates = TemplateRegistry::with_builtins()?;
        templates.load_default_dirs(&config.template_dirs);

        let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_db_path {
            Some(path) => Arc::new(SqliteArtifactStore::open(path)?),
            None => Arc::new(MemoryArtifactStore::new()),
        };
        Ok(Self::new(config, templates, artifacts))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn broker(&self) -> &CollaborationBroker {
        &self.broker
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn subscribe(&self, observer: &str) -> ProgressSubscription {
        self.publisher.subscribe(observer)
    }

    /// Instantiate a registered template.
    pub fn create_plan(
        &self,
        template_name: &str,
        template_version: &str,
        initial_context: HashMap<String, serde_json::Value>,
    ) -> Result<String> {
        let template = self.templates.get(template_name, template_version)?;
        let plan_id = self.plans.create_plan(&template, initial_context)?;
        self.cancellations
            .write()
            .map_err(|_| EngineError::lock_poisoned("cancellation table"))?
            .insert(plan_id.clone(), CancellationToken::new());
        Ok(plan_id)
    }

    pub fn get_plan_status(&self, plan_id: &str) -> Result<PlanProgress> {
        self.plans.get_plan_status(plan_id)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<PlanInstance> {
        self.plans.get_plan(plan_id)
    }

    pub fn list_plans(&self) -> Result<Vec<PlanProgress>> {
        self.plans.list_plans()
    }

    /// Cancel a plan: its driver loop and pending collaboration waits are
    /// signalled, unstarted tasks are skipped.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<PlanProgress> {
        if let Some(token) = self.cancellation_token(plan_id)? {
            token.cancel();
        }
        self.plans.cancel_plan(plan_id)
    }

    pub fn get_ready_tasks(&self, plan_id: &str) -> Result<Vec<TaskState>> {
        self.plans.ready_tasks(plan_id)
    }

    pub fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        summary: Option<String>,
    ) -> Result<TaskState> {
        self.plans.update_task_status(task_id, new_status, summary)
    }

    pub fn get_task(&self, task_id: &str) -> Result<TaskState> {
        self.plans.get_task(task_id)
    }

    pub fn list_tasks(&self, plan_id: &str) -> Result<Vec<TaskState>> {
        self.plans.list_tasks(plan_id)
    }

    /// Run the driver loop for `plan_id` until the plan settles or is
    /// cancelled.
    pub async fn run_plan(&self, plan_id: &str) -> Result<PlanReport> {
        let cancel = self.plan_cancellation(plan_id)?;
        let driver = PlanDriver::new(
            self.plans.clone(),
            self.workers.clone(),
            self.artifacts.clone(),
            self.broker.clone(),
            DriverOptions::from(&self.config),
        );
        driver.run(plan_id, cancel).await
    }

    /// The plan's cancellation token. Remote workers hand it to
    /// [`CollaborationBroker::await_response`] so `cancel_plan` interrupts
    /// their waits too.
    pub fn plan_cancellation(&self, plan_id: &str) -> Result<CancellationToken> {
        self.cancellation_token(plan_id)?
            .ok_or_else(|| EngineError::NotFound(format!("Plan not found: {}", plan_id)))
    }

    /// Wait on a collaboration request on behalf of a worker of `plan_id`;
    /// cancelling the plan ends the wait with `Cancelled`.
    pub async fn await_response(
        &self,
        plan_id: &str,
        request_id: &str,
        timeout: std::time::Duration,
    ) -> Result<CollaborationOutcome> {
        let cancel = self.plan_cancellation(plan_id)?;
        self.broker.await_response(request_id, timeout, &cancel).await
    }

    /// Forget a finished plan and its cancellation token.
    pub fn remove_plan(&self, plan_id: &str) -> Result<PlanInstance> {
        let plan = self.plans.remove_plan(plan_id)?;
        if let Ok(mut tokens) = self.cancellations.write() {
            tokens.remove(plan_id);
        }
        Ok(plan)
    }

    fn cancellation_token(&self, plan_id: &str) -> Result<Option<CancellationToken>> {
        Ok(self
            .cancellations
            .read()
            .map_err(|_| EngineError::lock_poisoned("cancellation table"))?
            .get(plan_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::{FailureReason, PlanStatus};

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            TemplateRegistry::with_builtins().unwrap(),
            Arc::new(MemoryArtifactStore::new()),
        )
    }

    #[test]
    fn test_create_plan_from_registered_template() {
        let engine = engine();
        let mut context = HashMap::new();
        context.insert("location".to_string(), serde_json::json!("Harbour district"));
        let plan_id = engine
            .create_plan("emergency-response", "1.0", context)
            .unwrap();

        let status = engine.get_plan_status(&plan_id).unwrap();
        assert_eq!(status.status, PlanStatus::Running);
        assert_eq!(status.total_task_count, 5);

        let ready = engine.get_ready_tasks(&plan_id).unwrap();
        let names: Vec<&str> = ready.iter().map(|t| t.template_task_id.as_str()).collect();
        assert_eq!(names, vec!["hazard_assessment", "weather_outlook"]);
        assert!(ready[0].description.contains("Harbour district"));
    }

    #[test]
    fn test_unknown_template_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.create_plan("emergency-response", "9.9", HashMap::new()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let engine = engine();
        let plan_id = engine
            .create_plan("emergency-response", "1.0", HashMap::new())
            .unwrap();

        let progress = engine.cancel_plan(&plan_id).unwrap();
        assert_eq!(progress.failure_reason, Some(FailureReason::Cancelled));

        let report = engine.run_plan(&plan_id).await.unwrap();
        assert_eq!(report.status, PlanStatus::Failed);
        assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Skipped));

        engine.remove_plan(&plan_id).unwrap();
        assert!(engine.run_plan(&plan_id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_plan_interrupts_remote_wait() {
        let engine = Arc::new(engine());
        let plan_id = engine
            .create_plan("emergency-response", "1.0", HashMap::new())
            .unwrap();
        let request_id = engine
            .broker()
            .submit(
                "field-team",
                "incident-commander",
                "confirm road closure",
                HashMap::new(),
                std::time::Duration::from_secs(60),
            )
            .unwrap();

        let waiter = {
            let engine = engine.clone();
            let plan_id = plan_id.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                engine
                    .await_response(&plan_id, &request_id, std::time::Duration::from_secs(30))
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine.cancel_plan(&plan_id).unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, CollaborationOutcome::Cancelled);
        assert!(engine.plan_cancellation(&plan_id).unwrap().is_cancelled());
        assert!(matches!(
            engine.plan_cancellation("plan-missing"),
            Err(EngineError::NotFound(_))
        ));
    }
}
