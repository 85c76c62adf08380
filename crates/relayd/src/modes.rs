//! Process assembly for each daemon mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use relaygrid_client::{RegistryClient, RemoteDirectory};
use relaygrid_core::{GatewayConfig, InstanceSource};
use relaygrid_proxy::{Gateway, build_router};
use relaygrid_registry::{Registry, spawn_sweeper};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Timeout for calls from a gateway to its registry.
const REGISTRY_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_standalone(config: GatewayConfig) -> anyhow::Result<()> {
    info!("relayd starting in standalone mode");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal = spawn_ctrl_c(Arc::clone(&shutdown_tx));

    // ── Registry ───────────────────────────────────────────────

    let registry = Arc::new(Registry::new(&config.registry));
    let sweeper = spawn_sweeper(
        Arc::clone(&registry),
        config.registry.sweep_interval,
        shutdown_rx.clone(),
    );
    let registry_server = tokio::spawn(serve(
        "registry",
        config.server.registry_listen,
        relaygrid_api::build_router(Arc::clone(&registry)),
        shutdown_rx.clone(),
    ));

    // ── Gateway ────────────────────────────────────────────────

    let source: Arc<dyn InstanceSource> = registry;
    let gateway = Arc::new(Gateway::new(&config, source));
    warn_if_no_routes(&config);
    let gateway_result = serve(
        "gateway",
        config.server.gateway_listen,
        build_router(gateway),
        shutdown_rx,
    )
    .await;

    // Bring the registry down too if the gateway stopped on its own.
    let _ = shutdown_tx.send(true);
    let registry_result = registry_server.await?;
    let _ = sweeper.await;
    signal.abort();

    gateway_result?;
    registry_result?;
    info!("relayd stopped");
    Ok(())
}

pub async fn run_registry(config: GatewayConfig) -> anyhow::Result<()> {
    info!("relayd starting in registry mode");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal = spawn_ctrl_c(Arc::clone(&shutdown_tx));

    let registry = Arc::new(Registry::new(&config.registry));
    let sweeper = spawn_sweeper(
        Arc::clone(&registry),
        config.registry.sweep_interval,
        shutdown_rx.clone(),
    );

    let result = serve(
        "registry",
        config.server.registry_listen,
        relaygrid_api::build_router(registry),
        shutdown_rx,
    )
    .await;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    signal.abort();
    result?;
    info!("relayd stopped");
    Ok(())
}

pub async fn run_gateway(config: GatewayConfig, registry_url: &str) -> anyhow::Result<()> {
    info!(%registry_url, "relayd starting in gateway mode");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal = spawn_ctrl_c(Arc::clone(&shutdown_tx));

    let client = RegistryClient::new(registry_url, REGISTRY_CALL_TIMEOUT)?;
    let directory = Arc::new(RemoteDirectory::new(client, config.routed_services()));
    let refresher = directory.spawn_refresh(config.registry.fetch_interval, shutdown_rx.clone());

    let source: Arc<dyn InstanceSource> = directory;
    let gateway = Arc::new(Gateway::new(&config, source));
    warn_if_no_routes(&config);

    let result = serve(
        "gateway",
        config.server.gateway_listen,
        build_router(gateway),
        shutdown_rx,
    )
    .await;

    let _ = shutdown_tx.send(true);
    let _ = refresher.await;
    signal.abort();
    result?;
    info!("relayd stopped");
    Ok(())
}

/// Serve `router` on `addr` until the shutdown channel fires.
async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(server = name, %addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!(server = name, "draining connections");
    })
    .await?;
    Ok(())
}

fn spawn_ctrl_c(shutdown_tx: Arc<watch::Sender<bool>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
}

fn warn_if_no_routes(config: &GatewayConfig) {
    if config.routes.is_empty() {
        warn!("no routes configured, every proxied request will get 404");
    }
}
