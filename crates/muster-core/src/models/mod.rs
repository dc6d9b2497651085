pub mod artifact;
pub mod collaboration;
pub mod plan;
pub mod task;

pub use artifact::*;
pub use collaboration::*;
pub use plan::*;
pub use task::*;
