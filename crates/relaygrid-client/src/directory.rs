//! Gateway-side cache of the registry.
//!
//! `RemoteDirectory` pulls the live instances of every routed service
//! on a fixed interval and serves lookups from memory. A failed refresh
//! keeps the previous snapshot for that service.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use relaygrid_core::{InstanceSource, ServiceInstance};

use crate::client::RegistryClient;

/// Refresh statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    pub services_refreshed: usize,
    pub services_failed: usize,
    pub instances_total: usize,
}

pub struct RemoteDirectory {
    client: RegistryClient,
    services: Vec<String>,
    cache: RwLock<HashMap<String, Vec<ServiceInstance>>>,
}

impl RemoteDirectory {
    pub fn new(client: RegistryClient, services: Vec<String>) -> Self {
        Self {
            client,
            services,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Fetch every tracked service once.
    pub async fn refresh(&self) -> RefreshStats {
        let mut stats = RefreshStats::default();

        for service in &self.services {
            match self.client.list_instances(service).await {
                Ok(instances) => {
                    stats.services_refreshed += 1;
                    stats.instances_total += instances.len();
                    self.cache
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(service.clone(), instances);
                }
                Err(e) => {
                    stats.services_failed += 1;
                    warn!(%service, error = %e, "directory refresh failed, keeping last snapshot");
                }
            }
        }

        debug!(
            refreshed = stats.services_refreshed,
            failed = stats.services_failed,
            instances = stats.instances_total,
            "directory refreshed"
        );
        stats
    }

    /// Refresh now, then every `interval` until `shutdown` changes.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(services = self.services.len(), interval = ?interval, "directory refresh loop started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.changed() => {
                    info!("directory refresh loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_refresh(interval, shutdown))
    }
}

impl InstanceSource for RemoteDirectory {
    fn live_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}
