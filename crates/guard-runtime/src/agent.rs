use std::sync::Arc;
use std::time::Duration;

use guard_channel::RemoteChannel;
use guard_core::{JobKind, PersistenceError};
use guard_producer::ArtifactProducer;
use guard_storage::{ProtectionStore, QueueStore, RecoveryReport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::{Admission, Dispatcher};
use crate::monitor::spawn_monitor;
use crate::protection::ProtectionController;
use crate::router::Router;
use crate::state::Shared;
use crate::worker::{DeliveryWorker, WorkerConfig};

#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub worker: WorkerConfig,
    pub probe_interval: Duration,
    pub poll_interval: Duration,
    pub startup_kinds: Vec<JobKind>,
    /// Channel identity of the only sender whose commands are obeyed.
    pub recipient: String,
}

impl AgentSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker: cfg.worker_config(),
            probe_interval: Duration::from_secs(cfg.delivery.probe_interval_secs),
            poll_interval: Duration::from_millis(cfg.delivery.poll_interval_ms),
            startup_kinds: cfg.startup.kinds.clone(),
            recipient: cfg.recipient_id(),
        }
    }
}

/// The resident process: dispatcher, delivery worker, connectivity monitor
/// and command router over one store and one channel.
pub struct Agent {
    shared: Shared,
    dispatcher: Dispatcher,
    channel: Arc<dyn RemoteChannel>,
    settings: AgentSettings,
}

impl Agent {
    /// Recovers the queue and loads the protection flag. Nothing runs yet.
    pub fn new(
        store: Arc<dyn QueueStore>,
        protection_store: Arc<dyn ProtectionStore>,
        channel: Arc<dyn RemoteChannel>,
        producer: Arc<dyn ArtifactProducer>,
        settings: AgentSettings,
    ) -> Result<Self, PersistenceError> {
        let report = store.recover()?;
        if report != RecoveryReport::default() {
            info!(
                reclaimed = report.reclaimed,
                payloads_released = report.payloads_released,
                "queue recovered after unclean shutdown"
            );
        }
        let protection = Arc::new(ProtectionController::load(protection_store)?);
        let shared = Shared::new(store, protection);
        let dispatcher = Dispatcher::new(shared.clone(), producer, settings.startup_kinds.clone());
        Ok(Self { shared, dispatcher, channel, settings })
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Fire the startup captures, then spawn the worker, monitor and router.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<AgentTasks, PersistenceError> {
        let startup = self.dispatcher.fire_startup()?;
        info!(
            admitted = startup.iter().filter(|a| a.job_id().is_some()).count(),
            protection = self.shared.protection.is_enabled(),
            "startup trigger fired"
        );

        let worker = DeliveryWorker::new(self.shared.clone(), self.channel.clone(), self.settings.worker.clone())
            .start(shutdown.clone());
        let monitor =
            spawn_monitor(self.shared.clone(), self.channel.clone(), self.settings.probe_interval, shutdown.clone());
        let router = Router::new(
            self.shared.clone(),
            self.dispatcher.clone(),
            self.channel.clone(),
            self.settings.recipient.clone(),
            self.settings.poll_interval,
        );
        let router = tokio::spawn(router.run(shutdown));
        Ok(AgentTasks { startup, worker, monitor, router })
    }
}

pub struct AgentTasks {
    pub startup: Vec<Admission>,
    worker: JoinHandle<()>,
    monitor: JoinHandle<()>,
    router: JoinHandle<()>,
}

impl AgentTasks {
    /// Wait for the background tasks after shutdown was signalled.
    pub async fn join(self) {
        let handles = [("worker", self.worker), ("monitor", self.monitor), ("router", self.router)];
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!("{name} task ended abnormally: {e}");
            }
        }
    }
}
