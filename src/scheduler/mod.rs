//! Task scheduling: priority queues, execution tracking, retries.

mod queue;
mod task;

pub use queue::{SchedulerStats, TaskScheduler};
pub use task::{
    Checkpoint, RetryAttempt, TaskDefinition, TaskExecution, TaskPriority, TaskStatus,
};
