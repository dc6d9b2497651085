pub mod artifact_store;
pub mod plan_store;

pub use artifact_store::{ArtifactStore, MemoryArtifactStore, SqliteArtifactStore};
pub use plan_store::PlanStore;
