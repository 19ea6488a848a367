//! Task definitions and run-state.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority levels, lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// All levels, highest first (dequeue order).
    pub const DESCENDING: [TaskPriority; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    pub(crate) fn queue_index(&self) -> usize {
        match self {
            Self::Background => 0,
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of requested work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub task_name: String,
    pub task_type: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub priority: TaskPriority,
    /// Execution timeout; scheduler default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry budget; scheduler default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub require_consensus: bool,
    #[serde(default)]
    pub input_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    pub fn new(task_name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            task_type: task_type.into(),
            required_capabilities: Vec::new(),
            priority: TaskPriority::default(),
            timeout_secs: None,
            max_retries: None,
            require_consensus: false,
            input_data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn require_consensus(mut self) -> Self {
        self.require_consensus = true;
        self
    }
}

/// Execution state machine:
/// `Pending → Running → {Completed | Failed}`, `Failed → Pending` (retry,
/// bounded), `Pending → Cancelled` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Timestamped progress marker; observational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub progress_pct: u8,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One failed attempt in a task's retry chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub error_message: String,
    pub at: DateTime<Utc>,
}

/// Mutable run-state for one task's attempt chain. Retries mutate this
/// record, appending to `retry_history`, rather than creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub assigned_service_id: Option<String>,
    pub attempt_number: u32,
    pub progress_pct: u8,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub retry_history: Vec<RetryAttempt>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Monotonic start marker used by the timeout sweep.
    #[serde(skip)]
    pub started_instant: Option<Instant>,
    /// Set while the dispatcher holds the dequeued task; blocks cancellation
    /// until the attempt resolves.
    #[serde(skip)]
    pub(crate) dispatch_claimed: bool,
}

impl TaskExecution {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            assigned_service_id: None,
            attempt_number: 1,
            progress_pct: 0,
            checkpoints: Vec::new(),
            retry_history: Vec::new(),
            start_time: None,
            end_time: None,
            output_data: None,
            error_message: None,
            error_details: None,
            started_instant: None,
            dispatch_claimed: false,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
