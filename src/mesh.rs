//! Top-level coordination facade wiring every subsystem together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::balancer::{BalancerStats, LoadBalancer, SelectionPolicy};
use crate::config::MeshConfig;
use crate::consensus::{ConsensusManager, ConsensusStats, ConsensusType, ProposalStatus};
use crate::error::{MeshError, Result};
use crate::health::{HealthChecker, HealthMonitor, HealthStats};
use crate::messaging::MessageTransport;
use crate::orchestrator::{OrchestratorStats, TaskOrchestrator};
use crate::registry::{
    DiscoveryFilter, RegistryStats, ServiceRecord, ServiceRegistry, ServiceStatus,
};
use crate::scheduler::{SchedulerStats, TaskDefinition, TaskExecution, TaskScheduler};

/// Combined counter snapshot across all subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshStats {
    pub registry: RegistryStats,
    pub health: HealthStats,
    pub balancer: BalancerStats,
    pub scheduler: SchedulerStats,
    pub orchestrator: OrchestratorStats,
    pub consensus: ConsensusStats,
}

/// Wires registry, health monitor, balancer, scheduler, orchestrator, and
/// consensus into one lifecycle-managed unit.
///
/// `start` spawns the background loops (cleanup, probes, timeout sweep,
/// expiry sweep, dispatch); `stop` aborts them. The programmatic API stays
/// usable for queries while stopped, but task submission requires a running
/// mesh since nothing would dispatch the work.
pub struct CoordinationMesh {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    scheduler: Arc<TaskScheduler>,
    consensus: Arc<ConsensusManager>,
    orchestrator: Arc<TaskOrchestrator>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationMesh {
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn MessageTransport>,
        checker: Arc<dyn HealthChecker>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ServiceRegistry::new(config.registry.clone()));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            checker,
            config.health.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            config.balancer.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone()));
        let consensus = Arc::new(ConsensusManager::new(config.consensus.clone()));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&balancer),
            Arc::clone(&consensus),
            transport,
            &config,
        ));

        Ok(Self {
            registry,
            health,
            balancer,
            scheduler,
            consensus,
            orchestrator,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn all background loops. Idempotent while already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Mesh already running");
            return;
        }

        let mut handles = self.handles.lock();
        handles.push(self.registry.spawn_cleanup());
        handles.push(self.health.spawn());
        handles.push(self.scheduler.spawn_sweep());
        handles.push(self.consensus.spawn_expiry_sweep());
        handles.push(self.orchestrator.spawn_dispatch_loop());
        info!(loops = handles.len(), "Coordination mesh started");
    }

    /// Abort the background loops. Idempotent while already stopped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        info!("Coordination mesh stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- registry ----

    /// Register an agent's service endpoint and return its service id.
    ///
    /// Registration asserts liveness: the record starts `Healthy` with a
    /// fresh heartbeat, and the probe loop re-derives status from there.
    pub fn register_agent_service(
        &self,
        agent_id: impl Into<String>,
        service_name: impl Into<String>,
        capabilities: Vec<String>,
        tags: Vec<String>,
    ) -> Result<String> {
        let record = ServiceRecord::new(agent_id, service_name)
            .with_capabilities(capabilities)
            .with_tags(tags);
        let service_id = record.service_id.clone();

        if !self.registry.register(record) {
            return Err(MeshError::ServiceAlreadyRegistered(service_id));
        }
        self.registry.heartbeat(&service_id);
        self.registry
            .update_status(&service_id, ServiceStatus::Healthy);
        Ok(service_id)
    }

    pub fn register_service(&self, record: ServiceRecord) -> Result<String> {
        let service_id = record.service_id.clone();
        if !self.registry.register(record) {
            return Err(MeshError::ServiceAlreadyRegistered(service_id));
        }
        self.registry.heartbeat(&service_id);
        Ok(service_id)
    }

    pub fn deregister_agent_service(&self, service_id: &str) -> bool {
        self.registry.deregister(service_id)
    }

    pub fn heartbeat(&self, service_id: &str) -> bool {
        self.registry.heartbeat(service_id)
    }

    pub fn discover_agents(
        &self,
        capability: Option<&str>,
        tag: Option<&str>,
    ) -> Vec<ServiceRecord> {
        let mut filter = DiscoveryFilter::new();
        if let Some(capability) = capability {
            filter = filter.with_capability(capability);
        }
        if let Some(tag) = tag {
            filter = filter.with_tag(tag);
        }
        self.registry.discover(&filter)
    }

    // ---- balancer ----

    pub fn select_agent(&self, capability: Option<&str>) -> Option<ServiceRecord> {
        self.balancer.select_service(None, capability)
    }

    pub fn select_agent_with_policy(
        &self,
        capability: Option<&str>,
        policy: SelectionPolicy,
    ) -> Option<ServiceRecord> {
        self.balancer.select_with_policy(None, capability, policy)
    }

    pub fn release_agent(&self, service_id: &str) {
        self.balancer.release_service(service_id);
    }

    // ---- scheduler / orchestrator ----

    /// Queue a task for dispatch. Requires a running mesh.
    pub fn submit_distributed_task(&self, definition: TaskDefinition) -> Result<String> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        Ok(self.scheduler.submit_task(definition))
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskExecution> {
        self.scheduler.get_execution(task_id)
    }

    pub fn update_task_progress(
        &self,
        task_id: &str,
        pct: u8,
        message: impl Into<String>,
    ) -> bool {
        self.scheduler.update_progress(task_id, pct, message)
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.scheduler.cancel_task(task_id)
    }

    /// Record a task result reported by its assigned agent, releasing the
    /// balancer connection and feeding the run time into the response-time
    /// window.
    pub fn complete_task(&self, task_id: &str, output: serde_json::Value) -> Result<()> {
        self.scheduler.complete_execution(task_id, output)?;

        if let Some(execution) = self.scheduler.get_execution(task_id) {
            if let Some(service_id) = execution.assigned_service_id.as_deref() {
                self.balancer.release_service(service_id);
                if let Some(ms) = execution.duration_ms() {
                    self.balancer
                        .record_response_time(service_id, Duration::from_millis(ms.max(0) as u64));
                }
            }
        }
        Ok(())
    }

    /// Record an agent-reported failure; the attempt is retried while the
    /// task's budget allows.
    pub fn fail_task(&self, task_id: &str, error_message: impl Into<String>) -> Result<bool> {
        let service_id = self
            .scheduler
            .get_execution(task_id)
            .and_then(|e| e.assigned_service_id);

        self.scheduler
            .fail_execution(task_id, error_message, None)?;
        if let Some(service_id) = service_id.as_deref() {
            self.balancer.release_service(service_id);
        }
        self.scheduler.add_retry_attempt(task_id)
    }

    // ---- consensus ----

    /// Open a proposal voted on by the currently healthy agents.
    pub fn propose_decision(
        &self,
        proposer_id: impl Into<String>,
        proposal_type: impl Into<String>,
        proposal_data: serde_json::Value,
        consensus_type: ConsensusType,
        timeout: Option<Duration>,
    ) -> String {
        let voters: Vec<(String, f64)> = self
            .registry
            .discover(&DiscoveryFilter::new().healthy())
            .into_iter()
            .map(|r| (r.agent_id, 1.0))
            .collect();
        self.consensus.propose_decision(
            proposer_id,
            proposal_type,
            proposal_data,
            consensus_type,
            timeout,
            &voters,
        )
    }

    pub fn cast_vote(
        &self,
        proposal_id: &str,
        voter_id: &str,
        approve: bool,
        weight: f64,
    ) -> Result<ProposalStatus> {
        self.consensus.cast_vote(proposal_id, voter_id, approve, weight)
    }

    pub fn get_proposal_status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        self.consensus.get_proposal_status(proposal_id)
    }

    // ---- observability ----

    pub fn comprehensive_stats(&self) -> MeshStats {
        MeshStats {
            registry: self.registry.stats(),
            health: self.health.stats(),
            balancer: self.balancer.stats(),
            scheduler: self.scheduler.stats(),
            orchestrator: self.orchestrator.stats(),
            consensus: self.consensus.stats(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }
}

impl Drop for CoordinationMesh {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FnHealthChecker;
    use crate::messaging::ChannelTransport;

    fn mesh() -> CoordinationMesh {
        let transport = Arc::new(ChannelTransport::default());
        let checker = Arc::new(FnHealthChecker::new(|_| Ok(())));
        CoordinationMesh::new(MeshConfig::default(), transport, checker).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_idempotent() {
        let mesh = mesh();
        assert!(!mesh.is_running());

        mesh.start();
        assert!(mesh.is_running());
        mesh.start();
        assert!(mesh.is_running());

        mesh.stop();
        assert!(!mesh.is_running());
        mesh.stop();
    }

    #[tokio::test]
    async fn test_submit_requires_running() {
        let mesh = mesh();
        let result = mesh.submit_distributed_task(TaskDefinition::new("sum", "compute"));
        assert!(matches!(result, Err(MeshError::NotRunning)));
    }

    #[tokio::test]
    async fn test_registration_and_discovery() {
        let mesh = mesh();
        let id = mesh
            .register_agent_service("a1", "compute", vec!["math".into()], vec!["gpu".into()])
            .unwrap();

        assert_eq!(mesh.discover_agents(Some("math"), None).len(), 1);
        assert_eq!(mesh.discover_agents(Some("vision"), None).len(), 0);
        assert_eq!(mesh.discover_agents(Some("math"), Some("gpu")).len(), 1);

        // Registration asserts liveness, so selection works immediately.
        let chosen = mesh.select_agent(Some("math")).unwrap();
        assert_eq!(chosen.service_id, id);
        mesh.release_agent(&id);

        assert!(mesh.deregister_agent_service(&id));
        assert!(mesh.select_agent(Some("math")).is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = MeshConfig::default();
        config.consensus.weighted_threshold = 2.0;
        let transport = Arc::new(ChannelTransport::default());
        let checker = Arc::new(FnHealthChecker::new(|_| Ok(())));
        assert!(CoordinationMesh::new(config, transport, checker).is_err());
    }

    #[tokio::test]
    async fn test_proposal_over_healthy_agents() {
        let mesh = mesh();
        mesh.register_agent_service("a1", "compute", vec![], vec![])
            .unwrap();
        mesh.register_agent_service("a2", "compute", vec![], vec![])
            .unwrap();
        mesh.register_agent_service("a3", "compute", vec![], vec![])
            .unwrap();

        let proposal_id = mesh.propose_decision(
            "a1",
            "rebalance",
            serde_json::json!({"shard": 1}),
            ConsensusType::Majority,
            None,
        );

        assert_eq!(
            mesh.cast_vote(&proposal_id, "a1", true, 1.0).unwrap(),
            ProposalStatus::Pending
        );
        assert_eq!(
            mesh.cast_vote(&proposal_id, "a2", true, 1.0).unwrap(),
            ProposalStatus::Accepted
        );
        assert_eq!(
            mesh.get_proposal_status(&proposal_id),
            Some(ProposalStatus::Accepted)
        );
    }

    #[tokio::test]
    async fn test_comprehensive_stats_cover_subsystems() {
        let mesh = mesh();
        mesh.register_agent_service("a1", "compute", vec!["math".into()], vec![])
            .unwrap();

        let stats = mesh.comprehensive_stats();
        assert_eq!(stats.registry.active_services, 1);
        assert_eq!(stats.scheduler.total_submitted, 0);
        assert_eq!(stats.consensus.total_proposals, 0);
        assert_eq!(stats.orchestrator.dispatched, 0);
    }
}
