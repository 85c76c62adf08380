//! Shared types used across relaygrid crates.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered instance.
///
/// `Up` while the lease is current, `Expiring` once the lease has lapsed
/// but the grace period is still running, `Removed` when the sweep has
/// evicted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Up,
    Expiring,
    Removed,
}

impl InstanceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "up",
            InstanceStatus::Expiring => "expiring",
            InstanceStatus::Removed => "removed",
        }
    }
}

/// A running process of a logical service, as seen by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    /// Wall-clock time of the first registration (epoch millis).
    pub registered_at_ms: u64,
    /// Wall-clock time of the latest heartbeat (epoch millis).
    pub last_heartbeat_ms: u64,
}

impl ServiceInstance {
    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Anything that can answer "which instances of this service are live".
///
/// Implemented by the in-process registry and by the remote directory
/// cache; consumed by the gateway's instance selection.
pub trait InstanceSource: Send + Sync {
    /// Snapshot of the `Up` instances of `service_name`.
    fn live_instances(&self, service_name: &str) -> Vec<ServiceInstance>;
}

impl<T: InstanceSource + ?Sized> InstanceSource for Arc<T> {
    fn live_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        (**self).live_instances(service_name)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
