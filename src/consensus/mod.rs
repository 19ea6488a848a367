//! Weighted voting for decisions that span agents.

mod manager;
mod proposal;

pub use manager::{ConsensusManager, ConsensusStats};
pub use proposal::{ConsensusProposal, ConsensusType, ProposalStatus};
