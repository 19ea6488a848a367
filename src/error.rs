use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Service already registered: {0}")]
    ServiceAlreadyRegistered(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task state: expected {expected}, got {actual}")]
    InvalidTaskState { expected: String, actual: String },

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Proposal already finalized: {0}")]
    ProposalFinalized(String),

    #[error("No healthy candidate for capabilities: {0}")]
    NoCandidate(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Health probe failed: {0}")]
    Probe(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Mesh is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MeshError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(_) | Self::Transport(_) | Self::Timeout(_) | Self::NoCandidate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MeshError::Timeout("dispatch".into()).is_transient());
        assert!(MeshError::NoCandidate("math".into()).is_transient());
        assert!(!MeshError::TaskNotFound("t1".into()).is_transient());
        assert!(!MeshError::Config("bad".into()).is_transient());
    }
}
