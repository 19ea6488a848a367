//! Authoritative membership set for live service instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;

use super::record::{ServiceRecord, ServiceStatus};

/// AND-combined discovery filter. An empty filter matches every record; a
/// record must carry every listed capability to match.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub service_type: Option<String>,
    pub capabilities: Vec<String>,
    pub tag: Option<String>,
    pub status: Option<ServiceStatus>,
}

impl DiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[String]) -> Self {
        self.capabilities.extend(capabilities.iter().cloned());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn healthy(self) -> Self {
        self.with_status(ServiceStatus::Healthy)
    }

    fn matches(&self, record: &ServiceRecord) -> bool {
        if let Some(service_type) = &self.service_type {
            if &record.service_type != service_type {
                return false;
            }
        }
        if !self
            .capabilities
            .iter()
            .all(|capability| record.has_capability(capability))
        {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !record.has_tag(tag) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active_services: usize,
    pub total_registrations: u64,
    pub total_deregistrations: u64,
    pub expired_records: u64,
}

/// Holds the authoritative set of live service instances.
///
/// All mutation goes through explicit calls (`register`, `deregister`,
/// `heartbeat`, `update_status`) plus the stale-heartbeat sweep; no other
/// component writes a record's status directly.
pub struct ServiceRegistry {
    config: RegistryConfig,
    records: RwLock<HashMap<String, ServiceRecord>>,
    total_registrations: AtomicU64,
    total_deregistrations: AtomicU64,
    expired_records: AtomicU64,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            total_registrations: AtomicU64::new(0),
            total_deregistrations: AtomicU64::new(0),
            expired_records: AtomicU64::new(0),
        }
    }

    /// Register a new instance. Returns false if the service id is taken.
    pub fn register(&self, record: ServiceRecord) -> bool {
        let mut records = self.records.write();
        if records.contains_key(&record.service_id) {
            warn!(service_id = %record.service_id, "Duplicate registration rejected");
            return false;
        }

        info!(
            service_id = %record.service_id,
            agent_id = %record.agent_id,
            service_type = %record.service_type,
            "Registered service"
        );
        records.insert(record.service_id.clone(), record);
        self.total_registrations.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove an instance. Returns false if unknown.
    pub fn deregister(&self, service_id: &str) -> bool {
        let removed = self.records.write().remove(service_id).is_some();
        if removed {
            info!(service_id = %service_id, "Deregistered service");
            self.total_deregistrations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Whether the record's last heartbeat is within the configured timeout.
    pub fn heartbeat_fresh(&self, service_id: &str) -> bool {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        self.records
            .read()
            .get(service_id)
            .and_then(|r| r.last_heartbeat)
            .map_or(false, |t| t.elapsed() <= timeout)
    }

    /// Refresh the heartbeat timestamp. Returns false if unknown.
    pub fn heartbeat(&self, service_id: &str) -> bool {
        let mut records = self.records.write();
        match records.get_mut(service_id) {
            Some(record) => {
                record.last_heartbeat = Some(std::time::Instant::now());
                true
            }
            None => false,
        }
    }

    /// Overwrite a record's status. Returns false if unknown.
    pub fn update_status(&self, service_id: &str, status: ServiceStatus) -> bool {
        let mut records = self.records.write();
        match records.get_mut(service_id) {
            Some(record) => {
                if record.status != status {
                    debug!(
                        service_id = %service_id,
                        from = %record.status,
                        to = %status,
                        "Status updated"
                    );
                }
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceRecord> {
        self.records.read().get(service_id).cloned()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.records.read().contains_key(service_id)
    }

    /// All records matching the AND-combination of the filter's fields.
    pub fn discover(&self, filter: &DiscoveryFilter) -> Vec<ServiceRecord> {
        self.records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn discover_all(&self) -> Vec<ServiceRecord> {
        self.discover(&DiscoveryFilter::default())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove records whose last heartbeat is older than the configured
    /// timeout. Returns the removed service ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let mut records = self.records.write();
        let expired: Vec<String> = records
            .values()
            .filter(|r| r.last_heartbeat.map_or(true, |t| t.elapsed() > timeout))
            .map(|r| r.service_id.clone())
            .collect();

        for service_id in &expired {
            records.remove(service_id);
            warn!(service_id = %service_id, "Removed stale service (heartbeat timeout)");
        }
        self.expired_records
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    /// Spawn the periodic stale-record sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(registry.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = registry.sweep_expired();
                if !removed.is_empty() {
                    debug!(count = removed.len(), "Cleanup sweep removed stale services");
                }
            }
        })
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_services: self.len(),
            total_registrations: self.total_registrations.load(Ordering::Relaxed),
            total_deregistrations: self.total_deregistrations.load(Ordering::Relaxed),
            expired_records: self.expired_records.load(Ordering::Relaxed),
        }
    }
}
