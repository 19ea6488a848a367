//! Proposal types and vote evaluation.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    #[default]
    Majority,
    Unanimous,
    WeightedThreshold,
}

impl ConsensusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Majority => "majority",
            Self::Unanimous => "unanimous",
            Self::WeightedThreshold => "weighted_threshold",
        }
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_final(&self) -> bool {
        *self != Self::Pending
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one evaluation pass over a proposal's votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VoteOutcome {
    Accept,
    Reject,
    Undecided,
}

/// A pending multi-agent decision.
///
/// `vote_weights` holds the electorate: voters enrolled at proposal time at
/// weight 1.0 plus any ad-hoc voter that joined by casting a vote. The
/// yes/total ratio is computed over that electorate, so an enrolled voter
/// who has not voted yet still counts toward the denominator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub proposal_id: String,
    pub proposer_id: String,
    pub proposal_type: String,
    pub proposal_data: serde_json::Value,
    pub consensus_type: ConsensusType,
    /// voter -> approve
    #[serde(default)]
    pub votes: HashMap<String, bool>,
    /// voter -> weight (default 1.0)
    #[serde(default)]
    pub vote_weights: HashMap<String, f64>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    /// Monotonic deadline used by the expiry sweep.
    #[serde(skip)]
    pub(crate) deadline: Option<Instant>,
}

impl ConsensusProposal {
    pub fn new(
        proposer_id: impl Into<String>,
        proposal_type: impl Into<String>,
        proposal_data: serde_json::Value,
        consensus_type: ConsensusType,
        timeout: std::time::Duration,
        voters: &[(String, f64)],
    ) -> Self {
        let mut vote_weights = HashMap::new();
        for (voter, weight) in voters {
            vote_weights.insert(voter.clone(), weight.max(0.0));
        }

        Self {
            proposal_id: Uuid::new_v4().to_string(),
            proposer_id: proposer_id.into(),
            proposal_type: proposal_type.into(),
            proposal_data,
            consensus_type,
            votes: HashMap::new(),
            vote_weights,
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
            deadline_at: Utc::now()
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero()),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn yes_weight(&self) -> f64 {
        self.votes
            .iter()
            .filter(|(_, approve)| **approve)
            .map(|(voter, _)| self.vote_weights.get(voter).copied().unwrap_or(1.0))
            .sum()
    }

    pub fn total_weight(&self) -> f64 {
        self.vote_weights.values().sum()
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Re-evaluate after a vote. Deadline handling lives in the manager.
    pub(crate) fn evaluate(&self, weighted_threshold: f64) -> VoteOutcome {
        if self.votes.is_empty() {
            return VoteOutcome::Undecided;
        }
        let total = self.total_weight();
        if total <= 0.0 {
            return VoteOutcome::Undecided;
        }

        match self.consensus_type {
            ConsensusType::Majority => {
                if self.yes_weight() > total / 2.0 {
                    VoteOutcome::Accept
                } else {
                    VoteOutcome::Undecided
                }
            }
            ConsensusType::Unanimous => {
                if self.votes.values().any(|approve| !approve) {
                    // One no kills a unanimous proposal for good.
                    VoteOutcome::Reject
                } else if self.votes.len() == self.vote_weights.len() {
                    VoteOutcome::Accept
                } else {
                    VoteOutcome::Undecided
                }
            }
            ConsensusType::WeightedThreshold => {
                if self.yes_weight() / total >= weighted_threshold {
                    VoteOutcome::Accept
                } else {
                    VoteOutcome::Undecided
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn voters(n: usize) -> Vec<(String, f64)> {
        (0..n).map(|i| (format!("v{}", i), 1.0)).collect()
    }

    fn proposal(consensus_type: ConsensusType, n_voters: usize) -> ConsensusProposal {
        ConsensusProposal::new(
            "proposer",
            "allocation",
            serde_json::Value::Null,
            consensus_type,
            Duration::from_secs(60),
            &voters(n_voters),
        )
    }

    #[test]
    fn test_majority_needs_two_of_three() {
        let mut p = proposal(ConsensusType::Majority, 3);
        p.votes.insert("v0".into(), true);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Undecided);

        p.votes.insert("v1".into(), true);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Accept);
    }

    #[test]
    fn test_unanimous_rejected_by_single_no() {
        let mut p = proposal(ConsensusType::Unanimous, 3);
        p.votes.insert("v0".into(), true);
        p.votes.insert("v1".into(), true);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Undecided);

        p.votes.insert("v2".into(), false);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Reject);
    }

    #[test]
    fn test_unanimous_accepts_when_all_voted_yes() {
        let mut p = proposal(ConsensusType::Unanimous, 2);
        p.votes.insert("v0".into(), true);
        p.votes.insert("v1".into(), true);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Accept);
    }

    #[test]
    fn test_weighted_threshold_ratio() {
        let mut p = ConsensusProposal::new(
            "proposer",
            "allocation",
            serde_json::Value::Null,
            ConsensusType::WeightedThreshold,
            Duration::from_secs(60),
            &[("heavy".into(), 3.0), ("light".into(), 1.0)],
        );

        p.votes.insert("light".into(), true);
        assert_eq!(p.evaluate(0.75), VoteOutcome::Undecided);

        p.votes.insert("heavy".into(), true);
        assert_eq!(p.evaluate(0.75), VoteOutcome::Accept);
    }

    #[test]
    fn test_no_votes_is_undecided() {
        let p = proposal(ConsensusType::Majority, 3);
        assert_eq!(p.evaluate(0.5), VoteOutcome::Undecided);
    }
}
