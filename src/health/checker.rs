//! Pluggable health-probe capability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MeshError, Result};
use crate::registry::ProbeTarget;

/// Probes a single target and reports healthy (`Ok`) or unhealthy (`Err`).
///
/// Implementations must be cheap to call concurrently; the monitor bounds
/// every probe with its own timeout, so a checker does not need one of its
/// own.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<()>;
}

/// Default checker: HTTP GET for `Http` targets, TCP connect for `Tcp`.
pub struct StandardHealthChecker {
    http: reqwest::Client,
}

impl StandardHealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for StandardHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthChecker for StandardHealthChecker {
    async fn probe(&self, target: &ProbeTarget) -> Result<()> {
        match target {
            ProbeTarget::Http { url } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| MeshError::Probe(format!("GET {}: {}", url, e)))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(MeshError::Probe(format!(
                        "GET {}: status {}",
                        url,
                        response.status()
                    )))
                }
            }
            ProbeTarget::Tcp { host, port } => {
                tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map(|_| ())
                    .map_err(|e| MeshError::Probe(format!("connect {}:{}: {}", host, port, e)))
            }
        }
    }
}

/// Caller-supplied probe function.
pub struct FnHealthChecker {
    func: Arc<dyn Fn(&ProbeTarget) -> std::result::Result<(), String> + Send + Sync>,
}

impl FnHealthChecker {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ProbeTarget) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl HealthChecker for FnHealthChecker {
    async fn probe(&self, target: &ProbeTarget) -> Result<()> {
        (self.func)(target).map_err(MeshError::Probe)
    }
}
