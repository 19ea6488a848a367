pub mod balancer;
pub mod config;
pub mod consensus;
pub mod error;
pub mod health;
pub mod mesh;
pub mod messaging;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;

pub use balancer::{BalancerStats, ConnectionGuard, LoadBalancer, SelectionPolicy};
pub use config::MeshConfig;
pub use consensus::{
    ConsensusManager, ConsensusProposal, ConsensusStats, ConsensusType, ProposalStatus,
};
pub use error::{MeshError, Result};
pub use health::{FnHealthChecker, HealthChecker, HealthMonitor, HealthStats, StandardHealthChecker};
pub use mesh::{CoordinationMesh, MeshStats};
pub use messaging::{AgentMailbox, ChannelTransport, DispatchAck, MessageTransport, TaskEnvelope};
pub use orchestrator::{DispatchOutcome, OrchestratorStats, TaskOrchestrator};
pub use registry::{
    DiscoveryFilter, ProbeTarget, RegistryStats, ServiceRecord, ServiceRegistry, ServiceStatus,
};
pub use scheduler::{
    SchedulerStats, TaskDefinition, TaskExecution, TaskPriority, TaskScheduler, TaskStatus,
};
