//! Workflow engine: SOP templates turned into running plans.
//!
//! # Architecture
//!
//! ```text
//! template.yaml ──► PlanTemplate ──► TemplateRegistry
//!                                          │ create_plan
//!                                     PlanStore ◄──── update_task_status
//!                                          │ ready tasks          ▲
//!                                     PlanDriver ──► Worker ──────┘
//!                                          │            │ ask / respond
//!                                  remote activation   CollaborationBroker
//! ```

pub mod driver;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod worker;

pub use driver::{DriverOptions, PlanDriver, PlanReport};
pub use registry::TemplateRegistry;
pub use resolver::{build_dependency_graph, ready_tasks, DependencyGraph};
pub use schema::{PlanTemplate, StepTemplate, TaskTemplate};
pub use worker::{Assignment, TaskDescriptor, TaskOutcome, Worker, WorkerContext, WorkerRegistry};
