//! Service registry: membership and liveness for agent-advertised services.

mod record;
mod service;

pub use record::{ProbeTarget, ServiceRecord, ServiceStatus};
pub use service::{DiscoveryFilter, RegistryStats, ServiceRegistry};
