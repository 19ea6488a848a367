//! Periodic health monitoring for registered services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::registry::{ServiceRegistry, ServiceStatus};

use super::checker::HealthChecker;

/// Rolling check counters.
#[derive(Debug, Default)]
struct HealthMetrics {
    total_checks: AtomicU64,
    successful_checks: AtomicU64,
    failed_checks: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl HealthMetrics {
    fn record_check(&self, success: bool, latency: Duration) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if success {
            self.successful_checks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_checks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Result of examining one record in a probe round.
enum CheckOutcome {
    Probed { healthy: bool, latency: Duration },
    /// Heartbeat-governed record; `Some` carries a status transition.
    Heartbeat(Option<ServiceStatus>),
}

/// Snapshot of check counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

/// Probes registered services on an interval and feeds results back into the
/// registry via `update_status`.
///
/// Probes for different records run concurrently; each is bounded by the
/// configured per-probe timeout so a hung probe cannot stall the round. A
/// probe error is recorded as a failed check, never propagated.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    checker: Arc<dyn HealthChecker>,
    config: HealthConfig,
    metrics: HealthMetrics,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        checker: Arc<dyn HealthChecker>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            checker,
            config,
            metrics: HealthMetrics::default(),
        }
    }

    /// Run one probe round over every registered record.
    pub async fn check_all(&self) {
        let records = self.registry.discover_all();
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);

        let probes = records.into_iter().map(|record| {
            let checker = Arc::clone(&self.checker);
            let registry = Arc::clone(&self.registry);
            async move {
                let Some(target) = record.probe.clone() else {
                    // No probe descriptor: heartbeat recency governs liveness.
                    // A record whose heartbeats stopped goes unhealthy until
                    // the registry sweep removes it; an explicitly set status
                    // is left alone while heartbeats stay fresh.
                    let next = if !registry.heartbeat_fresh(&record.service_id) {
                        Some(ServiceStatus::Unhealthy)
                    } else if record.status == ServiceStatus::Unknown {
                        Some(ServiceStatus::Healthy)
                    } else {
                        None
                    };
                    return (record.service_id, CheckOutcome::Heartbeat(next));
                };

                let start = Instant::now();
                let outcome = tokio::time::timeout(probe_timeout, checker.probe(&target)).await;
                let latency = start.elapsed();

                let healthy = match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(service_id = %record.service_id, error = %e, "Probe failed");
                        false
                    }
                    Err(_) => {
                        warn!(
                            service_id = %record.service_id,
                            timeout_ms = probe_timeout.as_millis() as u64,
                            "Probe timed out"
                        );
                        false
                    }
                };
                (record.service_id, CheckOutcome::Probed { healthy, latency })
            }
        });

        for (service_id, outcome) in join_all(probes).await {
            match outcome {
                CheckOutcome::Probed { healthy, latency } => {
                    self.metrics.record_check(healthy, latency);
                    let status = if healthy {
                        ServiceStatus::Healthy
                    } else {
                        ServiceStatus::Unhealthy
                    };
                    self.registry.update_status(&service_id, status);
                }
                CheckOutcome::Heartbeat(Some(status)) => {
                    self.registry.update_status(&service_id, status);
                }
                CheckOutcome::Heartbeat(None) => {}
            }
        }
    }

    /// Spawn the periodic probe loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(monitor.config.check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.check_all().await;
            }
        })
    }

    pub fn stats(&self) -> HealthStats {
        let total = self.metrics.total_checks.load(Ordering::Relaxed);
        let successful = self.metrics.successful_checks.load(Ordering::Relaxed);
        let failed = self.metrics.failed_checks.load(Ordering::Relaxed);
        let total_ms = self.metrics.total_latency_ms.load(Ordering::Relaxed);

        HealthStats {
            total_checks: total,
            successful_checks: successful,
            failed_checks: failed,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_latency_ms: if total > 0 { total_ms / total } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::health::FnHealthChecker;
    use crate::registry::{ProbeTarget, ServiceRecord};

    use async_trait::async_trait;

    fn setup(checker: Arc<dyn HealthChecker>) -> (Arc<ServiceRegistry>, HealthMonitor) {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig::default()));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            checker,
            HealthConfig {
                check_interval_secs: 1,
                probe_timeout_ms: 50,
            },
        );
        (registry, monitor)
    }

    #[tokio::test]
    async fn test_probe_results_update_status() {
        let checker = Arc::new(FnHealthChecker::new(|target| match target {
            ProbeTarget::Tcp { port, .. } if *port == 80 => Ok(()),
            _ => Err("connection refused".to_string()),
        }));
        let (registry, monitor) = setup(checker);

        let up = ServiceRecord::new("a1", "compute").with_probe(ProbeTarget::Tcp {
            host: "h".into(),
            port: 80,
        });
        let down = ServiceRecord::new("a2", "compute").with_probe(ProbeTarget::Tcp {
            host: "h".into(),
            port: 81,
        });
        let up_id = up.service_id.clone();
        let down_id = down.service_id.clone();
        registry.register(up);
        registry.register(down);

        monitor.check_all().await;

        assert_eq!(registry.get(&up_id).unwrap().status, ServiceStatus::Healthy);
        assert_eq!(
            registry.get(&down_id).unwrap().status,
            ServiceStatus::Unhealthy
        );

        let stats = monitor.stats();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.successful_checks, 1);
        assert_eq!(stats.failed_checks, 1);
    }

    #[tokio::test]
    async fn test_record_without_probe_assumed_healthy() {
        let checker = Arc::new(FnHealthChecker::new(|_| Err("unused".to_string())));
        let (registry, monitor) = setup(checker);

        let record = ServiceRecord::new("a1", "compute");
        let id = record.service_id.clone();
        registry.register(record);

        monitor.check_all().await;

        assert_eq!(registry.get(&id).unwrap().status, ServiceStatus::Healthy);
        assert_eq!(monitor.stats().total_checks, 0);
    }

    #[tokio::test]
    async fn test_explicit_unhealthy_survives_check_round() {
        let checker = Arc::new(FnHealthChecker::new(|_| Err("unused".to_string())));
        let (registry, monitor) = setup(checker);

        let record = ServiceRecord::new("a1", "compute");
        let id = record.service_id.clone();
        registry.register(record);
        registry.update_status(&id, ServiceStatus::Unhealthy);

        // Fresh heartbeats do not overrule an explicit status update.
        monitor.check_all().await;
        assert_eq!(
            registry.get(&id).unwrap().status,
            ServiceStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_stale_heartbeat_goes_unhealthy_without_probe() {
        let registry = Arc::new(ServiceRegistry::new(crate::config::RegistryConfig {
            heartbeat_timeout_secs: 0,
            cleanup_interval_secs: 30,
        }));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(FnHealthChecker::new(|_| Ok(()))),
            HealthConfig::default(),
        );

        let record = ServiceRecord::new("a1", "compute");
        let id = record.service_id.clone();
        registry.register(record);
        registry.update_status(&id, ServiceStatus::Healthy);

        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.check_all().await;
        assert_eq!(
            registry.get(&id).unwrap().status,
            ServiceStatus::Unhealthy
        );
    }

    struct HangingChecker;

    #[async_trait]
    impl HealthChecker for HangingChecker {
        async fn probe(&self, _target: &ProbeTarget) -> crate::error::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hung_probe_bounded_by_timeout() {
        let (registry, monitor) = setup(Arc::new(HangingChecker));

        let record = ServiceRecord::new("a1", "compute").with_probe(ProbeTarget::Tcp {
            host: "h".into(),
            port: 80,
        });
        let id = record.service_id.clone();
        registry.register(record);

        let start = Instant::now();
        monitor.check_all().await;
        assert!(start.elapsed() < Duration::from_secs(5));

        assert_eq!(
            registry.get(&id).unwrap().status,
            ServiceStatus::Unhealthy
        );
        assert_eq!(monitor.stats().failed_checks, 1);
    }
}
