//! Configuration structures and defaults.

use serde::{Deserialize, Serialize};

use crate::balancer::SelectionPolicy;
use crate::error::{MeshError, Result};

/// Top-level configuration for the coordination mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub balancer: BalancerConfig,
    pub scheduler: SchedulerConfig,
    pub orchestrator: OrchestratorConfig,
    pub consensus: ConsensusConfig,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.registry.heartbeat_timeout_secs == 0 {
            return Err(MeshError::Config(
                "registry.heartbeat_timeout_secs must be > 0".into(),
            ));
        }
        if self.registry.cleanup_interval_secs == 0 {
            return Err(MeshError::Config(
                "registry.cleanup_interval_secs must be > 0".into(),
            ));
        }
        if self.health.check_interval_secs == 0 {
            return Err(MeshError::Config(
                "health.check_interval_secs must be > 0".into(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(MeshError::Config(
                "health.probe_timeout_ms must be > 0".into(),
            ));
        }
        if self.balancer.response_window == 0 {
            return Err(MeshError::Config(
                "balancer.response_window must be > 0".into(),
            ));
        }
        if self.scheduler.sweep_interval_secs == 0 {
            return Err(MeshError::Config(
                "scheduler.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.consensus.weighted_threshold <= 0.0 || self.consensus.weighted_threshold > 1.0 {
            return Err(MeshError::Config(
                "consensus.weighted_threshold must be in (0, 1]".into(),
            ));
        }
        if self.consensus.expiry_sweep_interval_ms == 0 {
            return Err(MeshError::Config(
                "consensus.expiry_sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.orchestrator.poll_interval_ms == 0 {
            return Err(MeshError::Config(
                "orchestrator.poll_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Service registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds without a heartbeat before a record is swept out.
    pub heartbeat_timeout_secs: u64,
    /// Interval between stale-record sweeps.
    pub cleanup_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            cleanup_interval_secs: 30,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probe rounds.
    pub check_interval_secs: u64,
    /// Upper bound on a single probe; a hung probe must not block the round.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            probe_timeout_ms: 3_000,
        }
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Policy used when the caller does not override per call.
    pub default_policy: SelectionPolicy,
    /// Number of response-time samples kept per service.
    pub response_window: usize,
    /// Optional in-flight connection cap per service; candidates at the cap
    /// are skipped under every policy. `None` disables the cap.
    pub max_connections_per_service: Option<u32>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            default_policy: SelectionPolicy::RoundRobin,
            response_window: 20,
            max_connections_per_service: None,
        }
    }
}

/// Task scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default retry budget for submitted tasks.
    pub max_retries: u32,
    /// Default execution timeout applied when a definition has none.
    pub default_timeout_secs: u64,
    /// Interval between execution-timeout sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_timeout_secs: 300,
            sweep_interval_secs: 10,
        }
    }
}

/// Orchestrator dispatch-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval between scheduler polls when the queue is empty.
    pub poll_interval_ms: u64,
    /// Bound on one transport send awaiting an ack.
    pub dispatch_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            dispatch_timeout_ms: 10_000,
        }
    }
}

/// Consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Yes-weight ratio required by weighted-threshold proposals.
    pub weighted_threshold: f64,
    /// Default proposal lifetime when the proposer gives no timeout.
    pub default_timeout_secs: u64,
    /// Interval between deadline-expiry sweeps.
    pub expiry_sweep_interval_ms: u64,
    /// Interval used by the orchestrator while polling a gating proposal.
    pub gate_poll_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            weighted_threshold: 0.5,
            default_timeout_secs: 60,
            expiry_sweep_interval_ms: 500,
            gate_poll_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.registry.heartbeat_timeout_secs, 90);
        assert_eq!(config.health.probe_timeout_ms, 3_000);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.balancer.default_policy, SelectionPolicy::RoundRobin);
        assert!((config.consensus.weighted_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut config = MeshConfig::default();
        config.consensus.weighted_threshold = 0.0;
        assert!(config.validate().is_err());

        config.consensus.weighted_threshold = 1.5;
        assert!(config.validate().is_err());

        config.consensus.weighted_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let mut config = MeshConfig::default();
        config.registry.cleanup_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.orchestrator.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"scheduler": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.scheduler.max_retries, 5);
        assert_eq!(config.registry.heartbeat_timeout_secs, 90);
    }
}
