//! Decomposed sub-research tasks: the durable queue and its executor.

pub mod durable;
pub mod executor;
pub mod task;

pub use durable::{DurableTaskQueue, NewTask, QueueMetadata, TaskQueueDocument};
pub use executor::{ExecutionSummary, PlanRunner, TaskExecutor};
pub use task::{Task, TaskCategory, TaskMetadata, TaskPlanSummary, TaskPriority, TaskState, TaskUpdate};
