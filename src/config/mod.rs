//! Configuration types for the coordination mesh.
//!
//! Provides all configuration structures:
//! - `MeshConfig`: Top-level configuration with validation
//! - Per-subsystem configs: registry, health, balancer, scheduler,
//!   orchestrator, consensus

mod settings;

pub use settings::{
    BalancerConfig, ConsensusConfig, HealthConfig, MeshConfig, OrchestratorConfig, RegistryConfig,
    SchedulerConfig,
};
