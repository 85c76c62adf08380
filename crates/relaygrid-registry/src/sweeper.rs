//! Background eviction task.
//!
//! Runs `Registry::sweep` on a fixed interval until the shutdown
//! signal fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::directory::Registry;

/// Sweep `registry` every `interval` until `shutdown` changes.
pub async fn run_sweeper(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval = ?interval, "registry sweeper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = registry.sweep();
                debug!(
                    expiring = stats.marked_expiring,
                    evicted = stats.evicted.len(),
                    "sweep tick"
                );
            }
            _ = shutdown.changed() => {
                info!("registry sweeper shutting down");
                break;
            }
        }
    }
}

/// Spawn `run_sweeper` on the current runtime.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(registry, interval, shutdown))
}
