//! Priority queues, execution bookkeeping, and the timeout sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{MeshError, Result};

use super::task::{Checkpoint, RetryAttempt, TaskDefinition, TaskExecution, TaskPriority, TaskStatus};

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_submitted: u64,
    pub total_retries: u64,
    pub timed_out: u64,
}

/// Priority-ordered task queues with per-task execution records.
///
/// Pure data-structure component: it neither selects agents nor dispatches
/// work. One FIFO queue exists per priority level; `next_task` drains the
/// highest non-empty level first.
pub struct TaskScheduler {
    config: SchedulerConfig,
    /// One FIFO of task ids per priority level, indexed by `queue_index`.
    queues: Mutex<[VecDeque<String>; 5]>,
    definitions: RwLock<HashMap<String, TaskDefinition>>,
    executions: RwLock<HashMap<String, TaskExecution>>,
    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_cancelled: AtomicU64,
    total_retries: AtomicU64,
    total_timed_out: AtomicU64,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(Default::default()),
            definitions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            total_submitted: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_cancelled: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            total_timed_out: AtomicU64::new(0),
        }
    }

    /// Enqueue a definition and create its `Pending` execution record.
    pub fn submit_task(&self, definition: TaskDefinition) -> String {
        let task_id = definition.task_id.clone();
        let priority = definition.priority;

        self.executions
            .write()
            .insert(task_id.clone(), TaskExecution::new(&task_id));
        self.definitions
            .write()
            .insert(task_id.clone(), definition);
        self.queues.lock()[priority.queue_index()].push_back(task_id.clone());
        self.total_submitted.fetch_add(1, Ordering::Relaxed);

        info!(task_id = %task_id, priority = %priority, "Task submitted");
        task_id
    }

    /// Dequeue the highest-priority pending task, FIFO within a level.
    ///
    /// The dequeued execution is claimed for dispatch, which blocks
    /// `cancel_task` until the attempt resolves. The caller is responsible
    /// for following up with `start_execution`. Cancelled entries left in
    /// the queues are skipped here.
    pub fn next_task(&self) -> Option<TaskDefinition> {
        let mut queues = self.queues.lock();
        let mut executions = self.executions.write();
        for priority in TaskPriority::DESCENDING {
            let queue = &mut queues[priority.queue_index()];
            while let Some(task_id) = queue.pop_front() {
                let Some(execution) = executions.get_mut(&task_id) else {
                    continue;
                };
                if execution.status != TaskStatus::Pending {
                    continue;
                }
                execution.dispatch_claimed = true;
                drop(executions);
                drop(queues);
                return self.definitions.read().get(&task_id).cloned();
            }
        }
        None
    }

    /// Transition a dequeued task to `Running` with its assignment.
    pub fn start_execution(
        &self,
        task_id: &str,
        agent_id: &str,
        service_id: &str,
    ) -> Result<()> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if !execution.status.can_transition_to(TaskStatus::Running) {
            return Err(MeshError::InvalidTaskState {
                expected: TaskStatus::Pending.to_string(),
                actual: execution.status.to_string(),
            });
        }

        execution.status = TaskStatus::Running;
        execution.assigned_agent = Some(agent_id.to_string());
        execution.assigned_service_id = Some(service_id.to_string());
        execution.start_time = Some(Utc::now());
        execution.started_instant = Some(Instant::now());
        execution.end_time = None;
        execution.error_message = None;
        execution.error_details = None;

        debug!(task_id = %task_id, agent_id = %agent_id, "Task running");
        Ok(())
    }

    pub fn complete_execution(&self, task_id: &str, output: serde_json::Value) -> Result<()> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if !execution.status.can_transition_to(TaskStatus::Completed) {
            return Err(MeshError::InvalidTaskState {
                expected: TaskStatus::Running.to_string(),
                actual: execution.status.to_string(),
            });
        }

        execution.status = TaskStatus::Completed;
        execution.end_time = Some(Utc::now());
        execution.output_data = Some(output);
        execution.progress_pct = 100;
        self.total_completed.fetch_add(1, Ordering::Relaxed);

        info!(task_id = %task_id, "Task completed");
        Ok(())
    }

    pub fn fail_execution(
        &self,
        task_id: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if !execution.status.can_transition_to(TaskStatus::Failed) {
            return Err(MeshError::InvalidTaskState {
                expected: format!("{} or {}", TaskStatus::Running, TaskStatus::Pending),
                actual: execution.status.to_string(),
            });
        }

        let message = message.into();
        execution.status = TaskStatus::Failed;
        execution.end_time = Some(Utc::now());
        execution.error_message = Some(message.clone());
        execution.error_details = details;
        self.total_failed.fetch_add(1, Ordering::Relaxed);

        warn!(task_id = %task_id, error = %message, "Task failed");
        Ok(())
    }

    /// Bump the attempt counter on a failed task and re-queue it.
    ///
    /// Returns false when the retry budget is exhausted; the execution then
    /// stays terminally `Failed`.
    pub fn add_retry_attempt(&self, task_id: &str) -> Result<bool> {
        let definition = self
            .definitions
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        let max_retries = definition.max_retries.unwrap_or(self.config.max_retries);

        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if execution.status != TaskStatus::Failed {
            return Err(MeshError::InvalidTaskState {
                expected: TaskStatus::Failed.to_string(),
                actual: execution.status.to_string(),
            });
        }
        if execution.attempt_number >= max_retries {
            return Ok(false);
        }

        execution.retry_history.push(RetryAttempt {
            attempt_number: execution.attempt_number,
            error_message: execution
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            at: Utc::now(),
        });
        execution.attempt_number += 1;
        execution.status = TaskStatus::Pending;
        execution.assigned_agent = None;
        execution.assigned_service_id = None;
        execution.start_time = None;
        execution.started_instant = None;
        execution.end_time = None;
        execution.dispatch_claimed = false;
        drop(executions);

        self.queues.lock()[definition.priority.queue_index()].push_back(task_id.to_string());
        self.total_retries.fetch_add(1, Ordering::Relaxed);

        info!(task_id = %task_id, "Task re-queued for retry");
        Ok(true)
    }

    /// Append a checkpoint; observational only, never changes status.
    pub fn update_progress(&self, task_id: &str, pct: u8, message: impl Into<String>) -> bool {
        let mut executions = self.executions.write();
        match executions.get_mut(task_id) {
            Some(execution) => {
                execution.progress_pct = pct.min(100);
                execution.checkpoints.push(Checkpoint {
                    progress_pct: pct.min(100),
                    message: message.into(),
                    at: Utc::now(),
                });
                true
            }
            None => false,
        }
    }

    /// Cancel a task; only legal while it is still `Pending` and not yet
    /// claimed by a dispatch pass.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut executions = self.executions.write();
        match executions.get_mut(task_id) {
            Some(execution)
                if execution.status == TaskStatus::Pending && !execution.dispatch_claimed =>
            {
                execution.status = TaskStatus::Cancelled;
                execution.end_time = Some(Utc::now());
                self.total_cancelled.fetch_add(1, Ordering::Relaxed);
                info!(task_id = %task_id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    pub fn get_execution(&self, task_id: &str) -> Option<TaskExecution> {
        self.executions.read().get(task_id).cloned()
    }

    pub fn get_definition(&self, task_id: &str) -> Option<TaskDefinition> {
        self.definitions.read().get(task_id).cloned()
    }

    /// Resolved retry budget for a task.
    pub fn max_retries_for(&self, definition: &TaskDefinition) -> u32 {
        definition.max_retries.unwrap_or(self.config.max_retries)
    }

    /// Fail running executions that exceeded their timeout, re-queueing those
    /// with retry budget left. Returns the ids of timed-out tasks.
    pub fn sweep_timeouts(&self) -> Vec<String> {
        let overdue: Vec<String> = {
            let definitions = self.definitions.read();
            let executions = self.executions.read();
            executions
                .values()
                .filter(|e| e.status == TaskStatus::Running)
                .filter(|e| {
                    let timeout_secs = definitions
                        .get(&e.task_id)
                        .and_then(|d| d.timeout_secs)
                        .unwrap_or(self.config.default_timeout_secs);
                    e.started_instant
                        .map_or(false, |t| t.elapsed() > Duration::from_secs(timeout_secs))
                })
                .map(|e| e.task_id.clone())
                .collect()
        };

        for task_id in &overdue {
            self.total_timed_out.fetch_add(1, Ordering::Relaxed);
            if self
                .fail_execution(task_id, "execution timeout", None)
                .is_ok()
            {
                match self.add_retry_attempt(task_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(task_id = %task_id, "Timed-out task exhausted retries");
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "Retry bookkeeping failed"),
                }
            }
        }
        overdue
    }

    /// Spawn the periodic execution-timeout sweep.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let interval = Duration::from_secs(scheduler.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let timed_out = scheduler.sweep_timeouts();
                if !timed_out.is_empty() {
                    debug!(count = timed_out.len(), "Timeout sweep failed overdue tasks");
                }
            }
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let executions = self.executions.read();
        let pending = executions
            .values()
            .filter(|e| e.status == TaskStatus::Pending)
            .count();
        let running = executions
            .values()
            .filter(|e| e.status == TaskStatus::Running)
            .count();

        SchedulerStats {
            pending,
            running,
            completed: self.total_completed.load(Ordering::Relaxed),
            failed: self.total_failed.load(Ordering::Relaxed),
            cancelled: self.total_cancelled.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            timed_out: self.total_timed_out.load(Ordering::Relaxed),
        }
    }
}
