//! Dispatch pipeline driving tasks from the scheduler to agents.

mod dispatch;

pub use dispatch::{DispatchOutcome, OrchestratorStats, TaskOrchestrator};
