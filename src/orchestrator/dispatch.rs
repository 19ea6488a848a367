//! Dispatch pipeline: dequeue, gate, select, deliver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::MeshConfig;
use crate::consensus::{ConsensusManager, ConsensusType, ProposalStatus};
use crate::error::{MeshError, Result};
use crate::messaging::{MessageTransport, TaskEnvelope};
use crate::registry::{DiscoveryFilter, ServiceRegistry};
use crate::scheduler::{TaskDefinition, TaskScheduler};

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub consensus_gated: u64,
    pub consensus_rejections: u64,
}

/// Result of one pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queue was empty.
    Idle,
    /// Task handed to an agent which acked acceptance.
    Dispatched { task_id: String, agent_id: String },
    /// Task handed to a background consensus gate; delivery happens there
    /// once the proposal is accepted.
    Gated { task_id: String },
    /// Consensus gate rejected or expired; task failed without a retry.
    GateRejected { task_id: String },
    /// Dispatch failed; the task was re-queued or terminally failed
    /// depending on its retry budget.
    Failed { task_id: String, retried: bool },
}

/// Pulls tasks off the scheduler and drives them to an agent.
///
/// The pipeline for one task: balancer selection scoped to the task's
/// capabilities -> transport send bounded by the dispatch timeout ->
/// `start_execution` on an accepting ack. A consensus-gated task is handed
/// to its own background gate task so an unvoted proposal never holds up
/// the tasks queued behind it. Every failure path releases the balancer
/// connection it took; the connection for a successfully dispatched task
/// stays held until the task finishes.
pub struct TaskOrchestrator {
    registry: Arc<ServiceRegistry>,
    scheduler: Arc<TaskScheduler>,
    balancer: Arc<LoadBalancer>,
    consensus: Arc<ConsensusManager>,
    transport: Arc<dyn MessageTransport>,
    poll_interval: Duration,
    dispatch_timeout: Duration,
    gate_poll_interval: Duration,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    consensus_gated: AtomicU64,
    consensus_rejections: AtomicU64,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        scheduler: Arc<TaskScheduler>,
        balancer: Arc<LoadBalancer>,
        consensus: Arc<ConsensusManager>,
        transport: Arc<dyn MessageTransport>,
        config: &MeshConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            balancer,
            consensus,
            transport,
            poll_interval: Duration::from_millis(config.orchestrator.poll_interval_ms),
            dispatch_timeout: Duration::from_millis(config.orchestrator.dispatch_timeout_ms),
            gate_poll_interval: Duration::from_millis(config.consensus.gate_poll_interval_ms),
            dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            consensus_gated: AtomicU64::new(0),
            consensus_rejections: AtomicU64::new(0),
        }
    }

    /// Run one pipeline pass over the highest-priority pending task.
    ///
    /// A task that requires consensus is handed to its own gate task and the
    /// pass returns immediately, so the next pass can serve other tasks while
    /// the vote is open.
    pub async fn dispatch_next(self: &Arc<Self>) -> Result<DispatchOutcome> {
        let Some(definition) = self.scheduler.next_task() else {
            return Ok(DispatchOutcome::Idle);
        };
        let task_id = definition.task_id.clone();

        if definition.require_consensus {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run_gated_dispatch(definition).await {
                    warn!(error = %e, "Gated dispatch failed");
                }
            });
            return Ok(DispatchOutcome::Gated { task_id });
        }

        self.deliver(&definition).await
    }

    /// Await the dispatch proposal's verdict, then deliver on acceptance.
    async fn run_gated_dispatch(&self, definition: TaskDefinition) -> Result<DispatchOutcome> {
        let task_id = definition.task_id.clone();
        if !self.await_dispatch_consensus(&definition).await? {
            self.consensus_rejections.fetch_add(1, Ordering::Relaxed);
            // Gate rejection is terminal and does not consume a retry.
            self.scheduler
                .fail_execution(&task_id, "dispatch rejected by consensus", None)?;
            return Ok(DispatchOutcome::GateRejected { task_id });
        }
        self.deliver(&definition).await
    }

    /// Select a qualified agent and hand the task over, bounded by the
    /// dispatch timeout.
    async fn deliver(&self, definition: &TaskDefinition) -> Result<DispatchOutcome> {
        let task_id = definition.task_id.clone();

        let chosen = match self
            .balancer
            .select_for_capabilities(&definition.required_capabilities)
        {
            Some(record) => record,
            None => {
                let wanted = if definition.required_capabilities.is_empty() {
                    "*".to_string()
                } else {
                    definition.required_capabilities.join(", ")
                };
                debug!(task_id = %task_id, capabilities = %wanted, "No candidate available");
                return self.handle_dispatch_failure(&task_id, MeshError::NoCandidate(wanted));
            }
        };
        let service_id = chosen.service_id.clone();
        let agent_id = chosen.agent_id.clone();

        let attempt_number = self
            .scheduler
            .get_execution(&task_id)
            .map(|e| e.attempt_number)
            .unwrap_or(1);
        let envelope = TaskEnvelope::for_attempt(definition, attempt_number);

        let send = tokio::time::timeout(
            self.dispatch_timeout,
            self.transport.send(envelope, &agent_id),
        )
        .await;

        let ack = match send {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                self.balancer.release_service(&service_id);
                return self.handle_dispatch_failure(&task_id, e);
            }
            Err(_) => {
                self.balancer.release_service(&service_id);
                return self.handle_dispatch_failure(
                    &task_id,
                    MeshError::Timeout(format!("dispatch to {}", agent_id)),
                );
            }
        };

        if !ack.accepted {
            self.balancer.release_service(&service_id);
            let reason = ack
                .message
                .unwrap_or_else(|| "agent declined the task".to_string());
            return self.handle_dispatch_failure(&task_id, MeshError::Dispatch(reason));
        }

        if let Err(e) = self
            .scheduler
            .start_execution(&task_id, &agent_id, &service_id)
        {
            self.balancer.release_service(&service_id);
            return Err(e);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %task_id, agent_id = %agent_id, attempt = attempt_number, "Task dispatched");
        Ok(DispatchOutcome::Dispatched { task_id, agent_id })
    }

    /// Background loop polling the scheduler.
    pub fn spawn_dispatch_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match orchestrator.dispatch_next().await {
                    Ok(DispatchOutcome::Idle) => {
                        tokio::time::sleep(orchestrator.poll_interval).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Dispatch pass failed");
                        tokio::time::sleep(orchestrator.poll_interval).await;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            consensus_gated: self.consensus_gated.load(Ordering::Relaxed),
            consensus_rejections: self.consensus_rejections.load(Ordering::Relaxed),
        }
    }

    /// Raise a dispatch proposal over the healthy agents and wait for the
    /// verdict. The wait is bounded by the proposal's own deadline.
    async fn await_dispatch_consensus(&self, definition: &TaskDefinition) -> Result<bool> {
        self.consensus_gated.fetch_add(1, Ordering::Relaxed);

        let voters: Vec<(String, f64)> = self
            .registry
            .discover(&DiscoveryFilter::new().healthy())
            .into_iter()
            .map(|r| (r.agent_id, 1.0))
            .collect();

        let proposal_id = self.consensus.propose_decision(
            "orchestrator",
            "task_dispatch",
            serde_json::json!({
                "task_id": definition.task_id,
                "task_name": definition.task_name,
                "task_type": definition.task_type,
            }),
            ConsensusType::Majority,
            None,
            &voters,
        );
        info!(
            task_id = %definition.task_id,
            proposal_id = %proposal_id,
            voters = voters.len(),
            "Awaiting dispatch consensus"
        );

        loop {
            self.consensus.sweep_expired();
            match self.consensus.get_proposal_status(&proposal_id) {
                Some(ProposalStatus::Accepted) => return Ok(true),
                Some(ProposalStatus::Rejected) | Some(ProposalStatus::Expired) => {
                    return Ok(false);
                }
                Some(ProposalStatus::Pending) => {
                    tokio::time::sleep(self.gate_poll_interval).await;
                }
                None => return Err(MeshError::ProposalNotFound(proposal_id)),
            }
        }
    }

    /// Fail the attempt and re-queue while retry budget remains.
    fn handle_dispatch_failure(&self, task_id: &str, error: MeshError) -> Result<DispatchOutcome> {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        self.scheduler
            .fail_execution(task_id, error.to_string(), None)?;

        let retried = error.is_transient() && self.scheduler.add_retry_attempt(task_id)?;
        if retried {
            debug!(task_id = %task_id, error = %error, "Dispatch failed, re-queued");
        } else {
            warn!(task_id = %task_id, error = %error, "Dispatch failed terminally");
        }
        Ok(DispatchOutcome::Failed {
            task_id: task_id.to_string(),
            retried,
        })
    }
}
