//! Muster Core: plan execution engine for multi-agent emergency-response SOPs.
//!
//! A plan is instantiated from a declarative step/task template, tasks are
//! released as their inputs become available, workers run them (in-process
//! or remotely), ask each other for help through the collaboration broker,
//! and exchange payloads through the artifact store. Observers follow along
//! through the progress publisher.
//!
//! The crate has no HTTP or RPC surface; embed [`Engine`] in whatever
//! process hosts the workers.

pub mod collaboration;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use collaboration::{CollaborationBroker, CollaborationOutcome};
pub use config::EngineConfig;
pub use db::Database;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::{ProgressEvent, ProgressPublisher, ProgressSubscription};
pub use store::{ArtifactStore, MemoryArtifactStore, PlanStore, SqliteArtifactStore};
pub use workflow::{PlanReport, PlanTemplate, TemplateRegistry, Worker, WorkerContext};
