//! Versioned task lifecycle: registry, runner and the shared batch processor.

mod batch;
mod registry;
mod runner;
mod types;

pub use batch::{BatchProcessor, BatchProgress, BatchStage};
pub use registry::TaskRegistry;
pub use runner::{StageBehavior, StageError, TaskContext, TaskError, TaskRunner, parse_params};
pub(crate) use types::serialize_rfc3339;
pub use types::{Task, TaskFilter, TaskId, TaskIdentity, TaskStatus, TaskType};
