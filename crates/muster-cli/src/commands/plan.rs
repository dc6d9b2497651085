//! `muster plan`: instantiate a template and drive it with simulated workers.

use async_trait::async_trait;
use console::style;
use muster_core::events::ProgressEvent;
use muster_core::models::{PlanStatus, TaskStatus};
use muster_core::workflow::{TaskDescriptor, TaskOutcome};
use muster_core::{Engine, PlanReport, Worker, WorkerContext};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_context, print_json, truncate};

pub struct RunOptions {
    pub template: String,
    pub version: Option<String>,
    pub context: Vec<String>,
    pub fail_roles: Vec<String>,
    pub delay_ms: u64,
    pub watch: bool,
    pub json: bool,
}

/// Stand-in for a real analysis role: reads its inputs, waits, writes a JSON
/// note to each declared output.
pub struct SimulatedWorker {
    role: String,
    delay: Duration,
    fail: bool,
}

impl SimulatedWorker {
    pub fn new(role: &str, delay: Duration, fail: bool) -> Self {
        Self {
            role: role.to_string(),
            delay,
            fail,
        }
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn role(&self) -> &str {
        &self.role
    }

    async fn execute(&self, task: TaskDescriptor, ctx: WorkerContext) -> TaskOutcome {
        let mut inputs = Vec::with_capacity(task.input_artifacts.len());
        for key in &task.input_artifacts {
            match ctx.load_json::<serde_json::Value>(key).await {
                Ok(value) => inputs.push(value),
                Err(e) => return TaskOutcome::failed(format!("missing input {}: {}", key, e)),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = ctx.cancellation().cancelled() => {
                return TaskOutcome::failed("cancelled");
            }
        }
        ctx.heartbeat();

        if self.fail {
            tracing::info!("[Simulator] Role '{}' failing {} on request", self.role, task.task_id);
            return TaskOutcome::failed(format!("simulated failure in role '{}'", self.role));
        }

        for key in &task.output_artifacts {
            let name = key.rsplit('/').next().unwrap_or(key);
            let note = serde_json::json!({
                "task": task.task_id,
                "role": self.role,
                "summary": format!("{} by {}", task.name, self.role),
                "inputs": inputs.len(),
            });
            if let Err(e) = ctx.save_json(name, &note).await {
                return TaskOutcome::failed(e.to_string());
            }
        }
        TaskOutcome::completed(format!(
            "{} done ({} input(s), {} output(s))",
            task.name,
            inputs.len(),
            task.output_artifacts.len()
        ))
    }
}

/// Run a plan end to end. Fails when the plan ends `failed`.
pub async fn run(engine: Engine, options: RunOptions) -> Result<(), String> {
    let template = match &options.version {
        Some(v) => engine.templates().get(&options.template, v),
        None => engine.templates().latest(&options.template),
    }
    .map_err(|e| e.to_string())?;
    let context = parse_context(&options.context)?;

    let roles: BTreeSet<&str> = template
        .tasks()
        .map(|(_, task)| task.assignee.as_str())
        .collect();
    for role in &roles {
        let fail = options.fail_roles.iter().any(|r| r == role);
        engine
            .workers()
            .register(Arc::new(SimulatedWorker::new(
                role,
                Duration::from_millis(options.delay_ms),
                fail,
            )))
            .map_err(|e| e.to_string())?;
    }

    let observer = options.watch.then(|| engine.subscribe("cli"));
    let plan_id = engine
        .create_plan(&template.name, &template.version, context)
        .map_err(|e| e.to_string())?;
    if !options.json {
        println!(
            "🚀 Plan {} from {} v{} ({} tasks, {} roles)",
            plan_id,
            template.name,
            template.version,
            template.task_count(),
            roles.len()
        );
    }

    let run = engine.run_plan(&plan_id);
    tokio::pin!(run);
    let report = match &observer {
        Some(events) => loop {
            tokio::select! {
                report = &mut run => {
                    while let Some(event) = events.try_recv() {
                        print_event(&event);
                    }
                    break report;
                }
                Some(event) = events.recv() => print_event(&event),
            }
        },
        None => run.await,
    }
    .map_err(|e| e.to_string())?;

    if options.json {
        let value = serde_json::to_value(&report).map_err(|e| e.to_string())?;
        print_json(&value);
    } else {
        print_report(&report);
    }

    match report.status {
        PlanStatus::Completed => Ok(()),
        status => Err(format!(
            "Plan {} ended {}{}",
            report.plan_id,
            status,
            report
                .failure_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        )),
    }
}

fn print_event(event: &ProgressEvent) {
    println!(
        "   {} {} {} → {}",
        style(event.timestamp.format("%H:%M:%S%.3f")).dim(),
        event.task_id,
        event.old_status,
        styled_status(event.new_status)
    );
}

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        TaskStatus::Completed => style(text).green(),
        TaskStatus::Error => style(text).red(),
        TaskStatus::Skipped => style(text).yellow(),
        TaskStatus::InProgress => style(text).cyan(),
        _ => style(text),
    }
}

fn print_report(report: &PlanReport) {
    println!();
    println!("┌────────────────────────┬──────────────────────┬────────────┬──────────────────────────────────┐");
    println!("│ Task                   │ Assignee             │ Status     │ Summary                          │");
    println!("├────────────────────────┼──────────────────────┼────────────┼──────────────────────────────────┤");
    for task in &report.tasks {
        println!(
            "│ {:<22} │ {:<20} │ {:<10} │ {:<32} │",
            truncate(&format!("{}.{}", task.step_id, task.template_task_id), 22),
            truncate(&task.assignee, 20),
            task.status.as_str(),
            truncate(task.result_summary.as_deref().unwrap_or("-"), 32)
        );
    }
    println!("└────────────────────────┴──────────────────────┴────────────┴──────────────────────────────────┘");

    if !report.artifacts.is_empty() {
        println!("\n📦 Artifacts:");
        for key in &report.artifacts {
            println!("   {}", key);
        }
    }

    let completed = report.count_with_status(TaskStatus::Completed);
    match report.status {
        PlanStatus::Completed => println!(
            "\n🎉 Plan completed: {}/{} tasks",
            completed,
            report.tasks.len()
        ),
        _ => println!(
            "\n❌ Plan {}: {}/{} tasks completed",
            report.status,
            completed,
            report.tasks.len()
        ),
    }
}
