use std::sync::Arc;
use std::time::Duration;

use guard_channel::RemoteChannel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::state::{shutdown_requested, Shared};

/// Probes the channel on an interval, wakes the worker when the link comes
/// back, and picks up protection changes made by the CLI.
pub fn spawn_monitor(
    shared: Shared,
    channel: Arc<dyn RemoteChannel>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tick.tick() => {}
            }
            monitor_tick(&shared, channel.as_ref(), every).await;
        }
    })
}

pub async fn monitor_tick(shared: &Shared, channel: &dyn RemoteChannel, probe_timeout: Duration) {
    let probed = match tokio::time::timeout(probe_timeout, channel.probe()).await {
        Ok(res) => res.map_err(|e| e.to_string()),
        Err(_) => Err("probe timed out".to_string()),
    };
    match probed {
        Ok(()) => {
            if shared.link.observe(true) {
                info!("remote link up, waking delivery worker");
                shared.wake.notify_one();
            }
        }
        Err(e) => {
            if shared.link.connected() != Some(false) {
                warn!("remote link down: {e}");
            }
            shared.link.observe(false);
        }
    }
    if let Err(e) = shared.protection.refresh() {
        warn!("protection refresh error: {e}");
        shared.diagnostics.record_error(&e);
    }
}
