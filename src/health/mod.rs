//! Health monitoring: pluggable probes feeding registry status updates.

mod checker;
mod monitor;

pub use checker::{FnHealthChecker, HealthChecker, StandardHealthChecker};
pub use monitor::{HealthMonitor, HealthStats};
