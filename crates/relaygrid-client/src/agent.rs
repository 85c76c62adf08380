//! Heartbeat agent: keeps one instance registered.
//!
//! Registers on start, renews the lease every renewal interval,
//! re-registers when the registry has forgotten the instance, and
//! deregisters on shutdown. Transport failures are logged and the loop
//! carries on; the next tick is the retry.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::RegistryClient;

/// Identity and address an agent advertises.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    /// Lease renewal interval.
    pub interval: Duration,
}

pub struct HeartbeatAgent {
    client: RegistryClient,
    config: AgentConfig,
    registered: bool,
}

impl HeartbeatAgent {
    pub fn new(client: RegistryClient, config: AgentConfig) -> Self {
        Self {
            client,
            config,
            registered: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Register, or re-register after the registry forgot us.
    pub async fn register(&mut self) -> bool {
        let c = &self.config;
        match self
            .client
            .register(&c.service, &c.instance_id, &c.host, c.port)
            .await
        {
            Ok(instance) => {
                info!(
                    service = %c.service,
                    instance_id = %c.instance_id,
                    endpoint = %instance.endpoint(),
                    "registered with registry"
                );
                self.registered = true;
            }
            Err(e) => {
                warn!(service = %c.service, instance_id = %c.instance_id, error = %e, "registration failed");
                self.registered = false;
            }
        }
        self.registered
    }

    /// One renewal step.
    pub async fn beat(&mut self) {
        if !self.registered {
            self.register().await;
            return;
        }
        let c = &self.config;
        match self.client.heartbeat(&c.service, &c.instance_id).await {
            Ok(()) => debug!(service = %c.service, instance_id = %c.instance_id, "heartbeat sent"),
            Err(e) if e.is_not_found() => {
                info!(
                    service = %c.service,
                    instance_id = %c.instance_id,
                    "registry forgot instance, re-registering"
                );
                self.register().await;
            }
            Err(e) => {
                warn!(service = %c.service, instance_id = %c.instance_id, error = %e, "heartbeat failed");
            }
        }
    }

    /// Run until `shutdown` changes, then deregister.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            service = %self.config.service,
            instance_id = %self.config.instance_id,
            interval = ?self.config.interval,
            "heartbeat loop started"
        );
        self.register().await;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat().await,
                _ = shutdown.changed() => break,
            }
        }

        let c = &self.config;
        match self.client.deregister(&c.service, &c.instance_id).await {
            Ok(_) => info!(service = %c.service, instance_id = %c.instance_id, "deregistered"),
            Err(e) => warn!(service = %c.service, instance_id = %c.instance_id, error = %e, "deregistration failed"),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
