//! Selection policies and the balancer itself.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BalancerConfig;
use crate::registry::{DiscoveryFilter, ServiceRecord, ServiceRegistry};

/// Stride for pseudo-random candidate selection.
///
/// A prime stride over a modular counter gives good distribution without an
/// RNG dependency: it is coprime to most candidate-set sizes, so every
/// candidate is visited before the cycle repeats.
const RANDOM_SELECTION_STRIDE: usize = 7;

/// Scale factor turning fractional weights into integer positions on the
/// cumulative weight line.
const WEIGHT_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    Weighted,
    ResponseTime,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastConnections => "least_connections",
            Self::Weighted => "weighted",
            Self::ResponseTime => "response_time",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerStats {
    pub default_policy: SelectionPolicy,
    pub total_selections: u64,
    pub total_releases: u64,
    pub active_connections: u32,
    pub tracked_services: usize,
}

/// Selects one healthy service instance per call.
///
/// Reads candidates from the registry but never owns records. Callers must
/// pair every successful `select_service` with exactly one `release_service`
/// to keep connection counts accurate.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    config: BalancerConfig,
    /// Rotation counter per service type for round-robin.
    rotation: RwLock<HashMap<String, AtomicUsize>>,
    random_counter: AtomicUsize,
    /// In-flight connections per service id.
    connections: RwLock<HashMap<String, u32>>,
    weights: RwLock<HashMap<String, f64>>,
    /// Moving window of response-time samples (ms) per service id.
    response_times: RwLock<HashMap<String, VecDeque<u64>>>,
    total_selections: AtomicU64,
    total_releases: AtomicU64,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, config: BalancerConfig) -> Self {
        Self {
            registry,
            config,
            rotation: RwLock::new(HashMap::new()),
            random_counter: AtomicUsize::new(0),
            connections: RwLock::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            response_times: RwLock::new(HashMap::new()),
            total_selections: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
        }
    }

    /// Select a healthy instance using the configured default policy.
    ///
    /// Returns `None` when no candidate qualifies; absence is an expected
    /// outcome, not an error.
    pub fn select_service(
        &self,
        service_type: Option<&str>,
        capability: Option<&str>,
    ) -> Option<ServiceRecord> {
        self.select_with_policy(service_type, capability, self.config.default_policy)
    }

    /// Select a healthy instance using an explicit policy.
    pub fn select_with_policy(
        &self,
        service_type: Option<&str>,
        capability: Option<&str>,
        policy: SelectionPolicy,
    ) -> Option<ServiceRecord> {
        let mut filter = DiscoveryFilter::new().healthy();
        if let Some(service_type) = service_type {
            filter = filter.with_service_type(service_type);
        }
        if let Some(capability) = capability {
            filter = filter.with_capability(capability);
        }
        self.select_filtered(&filter, service_type.unwrap_or("*"), policy)
    }

    /// Select a healthy instance carrying every listed capability, using the
    /// configured default policy.
    pub fn select_for_capabilities(&self, capabilities: &[String]) -> Option<ServiceRecord> {
        let filter = DiscoveryFilter::new().healthy().with_capabilities(capabilities);
        self.select_filtered(&filter, "*", self.config.default_policy)
    }

    fn select_filtered(
        &self,
        filter: &DiscoveryFilter,
        type_key: &str,
        policy: SelectionPolicy,
    ) -> Option<ServiceRecord> {
        let mut candidates = self.registry.discover(filter);
        if let Some(cap) = self.config.max_connections_per_service {
            let connections = self.connections.read();
            candidates.retain(|r| {
                connections.get(&r.service_id).copied().unwrap_or(0) < cap
            });
        }
        if candidates.is_empty() {
            return None;
        }
        // Stable order so rotation visits each candidate once per cycle.
        candidates.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });

        let chosen = match policy {
            SelectionPolicy::RoundRobin => self.pick_round_robin(type_key, &candidates),
            SelectionPolicy::Random => self.pick_random(&candidates),
            SelectionPolicy::LeastConnections => self.pick_least_connections(&candidates),
            SelectionPolicy::Weighted => self.pick_weighted(&candidates),
            SelectionPolicy::ResponseTime => self.pick_response_time(&candidates),
        };

        *self
            .connections
            .write()
            .entry(chosen.service_id.clone())
            .or_insert(0) += 1;
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        debug!(
            service_id = %chosen.service_id,
            policy = %policy,
            "Selected service"
        );
        Some(chosen)
    }

    /// Release one in-flight connection. Must be called exactly once per
    /// successful selection.
    pub fn release_service(&self, service_id: &str) {
        let mut connections = self.connections.write();
        if let Some(count) = connections.get_mut(service_id) {
            *count = count.saturating_sub(1);
            self.total_releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bias weighted selection toward this service.
    pub fn set_service_weight(&self, service_id: &str, weight: f64) {
        self.weights
            .write()
            .insert(service_id.to_string(), weight.max(0.0));
    }

    /// Feed a response-time sample into the moving window.
    pub fn record_response_time(&self, service_id: &str, duration: Duration) {
        let mut windows = self.response_times.write();
        let window = windows.entry(service_id.to_string()).or_default();
        window.push_back(duration.as_millis() as u64);
        while window.len() > self.config.response_window {
            window.pop_front();
        }
    }

    pub fn connection_count(&self, service_id: &str) -> u32 {
        self.connections.read().get(service_id).copied().unwrap_or(0)
    }

    fn pick_round_robin(&self, type_key: &str, candidates: &[ServiceRecord]) -> ServiceRecord {
        let rotation = self.rotation.read();
        if let Some(counter) = rotation.get(type_key) {
            let idx = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
            return candidates[idx].clone();
        }
        drop(rotation);

        let mut rotation = self.rotation.write();
        let counter = rotation
            .entry(type_key.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[idx].clone()
    }

    fn pick_random(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        let n = self
            .random_counter
            .fetch_add(RANDOM_SELECTION_STRIDE, Ordering::Relaxed);
        candidates[n % candidates.len()].clone()
    }

    fn pick_least_connections(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        let connections = self.connections.read();
        candidates
            .iter()
            .min_by_key(|r| connections.get(&r.service_id).copied().unwrap_or(0))
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    fn pick_weighted(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        let weights = self.weights.read();
        let scaled: Vec<u64> = candidates
            .iter()
            .map(|r| {
                let w = weights.get(&r.service_id).copied().unwrap_or(1.0);
                (w * WEIGHT_SCALE) as u64
            })
            .collect();
        let total: u64 = scaled.iter().sum();
        if total == 0 {
            return candidates[0].clone();
        }

        // Walk the cumulative weight line at a pseudo-random position.
        let pos = (self
            .random_counter
            .fetch_add(RANDOM_SELECTION_STRIDE, Ordering::Relaxed) as u64
            * 997)
            % total;
        let mut acc = 0u64;
        for (record, weight) in candidates.iter().zip(&scaled) {
            acc += weight;
            if pos < acc {
                return record.clone();
            }
        }
        candidates[candidates.len() - 1].clone()
    }

    fn pick_response_time(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        let windows = self.response_times.read();
        candidates
            .iter()
            .min_by_key(|r| {
                windows
                    .get(&r.service_id)
                    .filter(|w| !w.is_empty())
                    .map(|w| w.iter().sum::<u64>() / w.len() as u64)
                    .unwrap_or(0)
            })
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    pub fn stats(&self) -> BalancerStats {
        let connections = self.connections.read();
        BalancerStats {
            default_policy: self.config.default_policy,
            total_selections: self.total_selections.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            active_connections: connections.values().sum(),
            tracked_services: connections.len(),
        }
    }
}

/// RAII guard pairing a selection with its release.
pub struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    service_id: String,
    released: bool,
}

impl ConnectionGuard {
    pub fn new(balancer: Arc<LoadBalancer>, service_id: impl Into<String>) -> Self {
        Self {
            balancer,
            service_id: service_id.into(),
            released: false,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn release(mut self) {
        self.balancer.release_service(&self.service_id);
        self.released = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.balancer.release_service(&self.service_id);
        }
    }
}
