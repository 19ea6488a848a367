//! Weighted voting over shared decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConsensusConfig;
use crate::error::{MeshError, Result};

use super::proposal::{ConsensusProposal, ConsensusType, ProposalStatus, VoteOutcome};

/// Snapshot of consensus activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub active_proposals: usize,
    pub completed_proposals: usize,
    pub total_proposals: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub expired: u64,
}

/// Collects votes, re-evaluates proposals after each vote, and expires
/// proposals whose deadline passed without a decision.
///
/// Finalized proposals move from the active map to the completed map and
/// never change status again.
pub struct ConsensusManager {
    config: ConsensusConfig,
    active: RwLock<HashMap<String, ConsensusProposal>>,
    completed: RwLock<HashMap<String, ConsensusProposal>>,
    total_proposals: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

impl ConsensusManager {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            total_proposals: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Open a proposal and return its id.
    ///
    /// `voters` enrolls the electorate; each enrolled voter counts toward the
    /// total weight whether or not they vote. A voter absent from the list
    /// may still cast a vote and joins the electorate at that point.
    pub fn propose_decision(
        &self,
        proposer_id: impl Into<String>,
        proposal_type: impl Into<String>,
        proposal_data: serde_json::Value,
        consensus_type: ConsensusType,
        timeout: Option<Duration>,
        voters: &[(String, f64)],
    ) -> String {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.default_timeout_secs));
        let proposal = ConsensusProposal::new(
            proposer_id,
            proposal_type,
            proposal_data,
            consensus_type,
            timeout,
            voters,
        );
        let proposal_id = proposal.proposal_id.clone();

        info!(
            proposal_id = %proposal_id,
            consensus_type = %consensus_type,
            voters = voters.len(),
            timeout_secs = timeout.as_secs(),
            "Opened proposal"
        );

        self.total_proposals.fetch_add(1, Ordering::Relaxed);
        self.active.write().insert(proposal_id.clone(), proposal);
        proposal_id
    }

    /// Record a vote and re-evaluate the proposal.
    ///
    /// Returns the proposal status after the vote. A repeat vote from the
    /// same voter overwrites the previous one. Votes against a finalized
    /// proposal are rejected with `ProposalFinalized`.
    pub fn cast_vote(
        &self,
        proposal_id: &str,
        voter_id: &str,
        approve: bool,
        weight: f64,
    ) -> Result<ProposalStatus> {
        let expired = match self.active.read().get(proposal_id) {
            Some(proposal) => proposal.is_expired(),
            None => {
                if self.completed.read().contains_key(proposal_id) {
                    return Err(MeshError::ProposalFinalized(proposal_id.to_string()));
                }
                return Err(MeshError::ProposalNotFound(proposal_id.to_string()));
            }
        };
        if expired {
            warn!(proposal_id = %proposal_id, voter_id = %voter_id, "Vote arrived after deadline");
            self.finalize(proposal_id, ProposalStatus::Expired);
            return Err(MeshError::ProposalFinalized(proposal_id.to_string()));
        }

        let decided = {
            let mut active = self.active.write();
            let proposal = active
                .get_mut(proposal_id)
                .ok_or_else(|| MeshError::ProposalFinalized(proposal_id.to_string()))?;

            proposal
                .vote_weights
                .insert(voter_id.to_string(), weight.max(0.0));
            proposal.votes.insert(voter_id.to_string(), approve);

            debug!(
                proposal_id = %proposal_id,
                voter_id = %voter_id,
                approve,
                weight,
                yes_weight = proposal.yes_weight(),
                total_weight = proposal.total_weight(),
                "Vote recorded"
            );

            match proposal.evaluate(self.config.weighted_threshold) {
                VoteOutcome::Accept => Some(ProposalStatus::Accepted),
                VoteOutcome::Reject => Some(ProposalStatus::Rejected),
                VoteOutcome::Undecided => None,
            }
        };

        match decided {
            Some(status) => {
                self.finalize(proposal_id, status);
                Ok(status)
            }
            None => Ok(ProposalStatus::Pending),
        }
    }

    /// Whether the proposal reached acceptance.
    pub fn check_consensus(&self, proposal_id: &str) -> bool {
        self.get_proposal_status(proposal_id) == Some(ProposalStatus::Accepted)
    }

    /// Status of an active or completed proposal.
    pub fn get_proposal_status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        if let Some(p) = self.active.read().get(proposal_id) {
            return Some(p.status);
        }
        self.completed.read().get(proposal_id).map(|p| p.status)
    }

    /// Ids of proposals still collecting votes.
    pub fn active_proposal_ids(&self) -> Vec<String> {
        self.active.read().keys().cloned().collect()
    }

    pub fn get_proposal(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        if let Some(p) = self.active.read().get(proposal_id) {
            return Some(p.clone());
        }
        self.completed.read().get(proposal_id).cloned()
    }

    /// Move expired active proposals to the completed map. Returns the ids
    /// that expired in this pass.
    pub fn sweep_expired(&self) -> Vec<String> {
        let expired_ids: Vec<String> = {
            let active = self.active.read();
            active
                .values()
                .filter(|p| p.is_expired())
                .map(|p| p.proposal_id.clone())
                .collect()
        };

        for proposal_id in &expired_ids {
            self.finalize(proposal_id, ProposalStatus::Expired);
        }
        expired_ids
    }

    /// Background expiry sweep.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.expiry_sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = manager.sweep_expired();
                if !expired.is_empty() {
                    debug!(count = expired.len(), "Expired proposals");
                }
            }
        })
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            active_proposals: self.active.read().len(),
            completed_proposals: self.completed.read().len(),
            total_proposals: self.total_proposals.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn finalize(&self, proposal_id: &str, status: ProposalStatus) {
        let Some(mut proposal) = self.active.write().remove(proposal_id) else {
            return;
        };
        proposal.status = status;

        match status {
            ProposalStatus::Accepted => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                info!(proposal_id = %proposal_id, "Proposal accepted");
            }
            ProposalStatus::Rejected => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                info!(proposal_id = %proposal_id, "Proposal rejected");
            }
            ProposalStatus::Expired => {
                self.expired.fetch_add(1, Ordering::Relaxed);
                warn!(proposal_id = %proposal_id, "Proposal expired without consensus");
            }
            ProposalStatus::Pending => {}
        }

        self.completed
            .write()
            .insert(proposal_id.to_string(), proposal);
    }
}
