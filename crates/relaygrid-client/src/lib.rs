//! relaygrid-client: talking to a remote registry.
//!
//! - [`RegistryClient`]: typed calls against the registry REST API
//! - [`HeartbeatAgent`]: keeps a service instance registered
//! - [`RemoteDirectory`]: an [`InstanceSource`](relaygrid_core::InstanceSource)
//!   for gateways that run apart from the registry

pub mod agent;
pub mod client;
pub mod directory;
pub mod error;

pub use agent::{AgentConfig, HeartbeatAgent};
pub use client::RegistryClient;
pub use directory::{RefreshStats, RemoteDirectory};
pub use error::{ClientError, ClientResult};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use relaygrid_core::RegistrySettings;
    use relaygrid_registry::Registry;
    use tokio::net::TcpListener;

    /// Serve a fresh registry API on a loopback port.
    pub async fn spawn_registry() -> (String, Arc<Registry>) {
        let registry = Arc::new(Registry::new(&RegistrySettings::default()));
        let app = relaygrid_api::build_router(Arc::clone(&registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), registry)
    }
}
