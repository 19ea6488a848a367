//! Service record types.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a registered service instance.
///
/// `Deregistered` is terminal and never stored: a deregistered record is
/// removed from the registry map entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Probe descriptor for the health monitor.
///
/// A record without a probe is assumed healthy for as long as heartbeats keep
/// arriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProbeTarget {
    Http { url: String },
    Tcp { host: String, port: u16 },
}

/// One advertised service instance. Owned exclusively by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub agent_id: String,
    pub service_id: String,
    pub service_name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeTarget>,
    pub registered_at: DateTime<Utc>,
    /// Monotonic heartbeat timestamp; refreshed by `heartbeat()`.
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl ServiceRecord {
    pub fn new(agent_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            agent_id: agent_id.into(),
            service_id: Uuid::new_v4().to_string(),
            service_type: service_name.clone(),
            service_name,
            host: "127.0.0.1".to_string(),
            port: 0,
            capabilities: Vec::new(),
            tags: Vec::new(),
            status: ServiceStatus::Unknown,
            metadata: HashMap::new(),
            probe: None,
            registered_at: Utc::now(),
            last_heartbeat: Some(Instant::now()),
        }
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_probe(mut self, probe: ProbeTarget) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }

    /// Seconds since the last heartbeat, or `None` if one was never recorded.
    pub fn heartbeat_age_secs(&self) -> Option<u64> {
        self.last_heartbeat.map(|t| t.elapsed().as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = ServiceRecord::new("agent-1", "compute")
            .with_endpoint("10.0.0.5", 8080)
            .with_capabilities(vec!["math".into(), "stats".into()])
            .with_tags(vec!["gpu".into()])
            .with_probe(ProbeTarget::Tcp {
                host: "10.0.0.5".into(),
                port: 8080,
            });

        assert_eq!(record.agent_id, "agent-1");
        assert_eq!(record.service_type, "compute");
        assert_eq!(record.port, 8080);
        assert!(record.has_capability("math"));
        assert!(!record.has_capability("vision"));
        assert!(record.has_tag("gpu"));
        assert_eq!(record.status, ServiceStatus::Unknown);
        assert!(record.last_heartbeat.is_some());
    }

    #[test]
    fn test_unique_service_ids() {
        let a = ServiceRecord::new("agent-1", "compute");
        let b = ServiceRecord::new("agent-1", "compute");
        assert_ne!(a.service_id, b.service_id);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ServiceStatus::Healthy.to_string(), "healthy");
        assert_eq!(ServiceStatus::Unknown.to_string(), "unknown");
    }
}
