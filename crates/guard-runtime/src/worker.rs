use std::sync::Arc;
use std::time::Duration;

use guard_channel::RemoteChannel;
use guard_core::{now_ms, BackoffPolicy, EpochMs, JobId, PersistenceError, QueueEntry, TransportError, WorkerId};
use guard_queue::{decide_retry, retry_schedule, RetryDecision};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::state::{shutdown_requested, Shared};

pub const CORRUPT_PAYLOAD_REASON: &str = "stored payload is missing or corrupt";

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Retries after an unreachable send. The send that fails after these
    /// is the last one, so a Failed entry stores `max_attempts + 1` attempts.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub send_timeout: Duration,
    pub lease_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 16,
            max_attempts: 4,
            backoff: BackoffPolicy::default(),
            send_timeout: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claims handed back untouched after the channel went down.
    pub released: usize,
    pub channel_down: bool,
    pub lease_lost: bool,
}

/// Drains the queue to the remote channel. Only the holder of the worker
/// lease claims entries, so at most one is active per store.
pub struct DeliveryWorker {
    shared: Shared,
    channel: Arc<dyn RemoteChannel>,
    cfg: WorkerConfig,
    owner: WorkerId,
}

impl DeliveryWorker {
    pub fn new(shared: Shared, channel: Arc<dyn RemoteChannel>, cfg: WorkerConfig) -> Self {
        Self { shared, channel, cfg, owner: WorkerId::new() }
    }

    fn hold_lease(&self, now: EpochMs) -> Result<bool, PersistenceError> {
        let ttl_ms = self.cfg.lease_ttl.as_millis() as i64;
        self.shared.store.try_acquire_worker_lease(&self.owner, ttl_ms, now)
    }

    /// Spawn the resident loop. Every cycle renews the lease first, so while
    /// another worker holds it this one claims nothing. It takes over once
    /// that lease is released or expires, e.g. after a crash.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = self.owner.as_str(), "delivery worker started");
        let mut tick = interval(self.cfg.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut holding: Option<bool> = None;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tick.tick() => {}
                _ = self.shared.wake.notified() => {}
            }
            match self.run_cycle(now_ms()).await {
                Ok(report) => {
                    let holds = !report.lease_lost;
                    if holding != Some(holds) {
                        if holds {
                            info!(owner = self.owner.as_str(), "delivery lease acquired");
                        } else {
                            info!("delivery lease held by another worker, standing by");
                        }
                        holding = Some(holds);
                    }
                    if report.claimed > 0 {
                        info!(
                            claimed = report.claimed,
                            delivered = report.delivered,
                            retried = report.retried,
                            failed = report.failed,
                            released = report.released,
                            "delivery cycle done"
                        );
                    }
                }
                Err(e) => {
                    error!("delivery cycle error: {e}");
                    self.shared.diagnostics.record_error(&e);
                }
            }
        }
        if let Err(e) = self.shared.store.release_worker_lease(&self.owner) {
            warn!("release worker lease: {e}");
        }
        info!("delivery worker stopped");
    }

    /// A single cycle outside the resident loop, e.g. `teleguard flush`.
    /// `None` when another worker holds the lease.
    pub async fn run_once(&self, now: EpochMs) -> Result<Option<CycleReport>, PersistenceError> {
        if !self.hold_lease(now)? {
            return Ok(None);
        }
        let res = self.run_cycle(now).await;
        self.shared.store.release_worker_lease(&self.owner)?;
        res.map(Some)
    }

    /// Claim a batch and deliver it in order. Stops at the first unreachable
    /// send and hands the rest of the batch back untouched.
    pub async fn run_cycle(&self, now: EpochMs) -> Result<CycleReport, PersistenceError> {
        let mut report = CycleReport::default();
        if !self.hold_lease(now)? {
            report.lease_lost = true;
            return Ok(report);
        }
        let batch = self.shared.store.dequeue_batch(self.cfg.batch_size, now)?;
        report.claimed = batch.len();
        let ids: Vec<JobId> = batch.iter().map(QueueEntry::id).collect();

        for (i, entry) in batch.iter().enumerate() {
            if i > 0 {
                match self.hold_lease(now_ms().max(now)) {
                    Ok(true) => {}
                    Ok(false) => {
                        report.lease_lost = true;
                        report.released += self.release_claims(&ids[i..]);
                        break;
                    }
                    Err(e) => {
                        self.release_claims(&ids[i..]);
                        return Err(e);
                    }
                }
            }
            match self.deliver(entry, now, &mut report).await {
                Ok(true) => {}
                Ok(false) => {
                    report.released += self.release_claims(&ids[i + 1..]);
                    break;
                }
                Err(e) => {
                    self.release_claims(&ids[i..]);
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Best effort; whatever cannot be released is reclaimed by `recover`.
    fn release_claims(&self, ids: &[JobId]) -> usize {
        let mut released = 0;
        for id in ids {
            match self.shared.store.release_claim(*id) {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(job_id = id.get(), "release claim: {e}");
                    self.shared.diagnostics.record_error(&e);
                }
            }
        }
        released
    }

    /// Returns false when the channel is unreachable and the cycle must stop.
    async fn deliver(&self, entry: &QueueEntry, now: EpochMs, report: &mut CycleReport) -> Result<bool, PersistenceError> {
        let id = entry.id();
        let store = &self.shared.store;
        let Some(artifact) = entry.artifact() else {
            error!(job_id = id.get(), "{CORRUPT_PAYLOAD_REASON}");
            store.mark_failed(id, CORRUPT_PAYLOAD_REASON, entry.delivery_attempts, now)?;
            report.failed += 1;
            return Ok(true);
        };

        let sent = match tokio::time::timeout(self.cfg.send_timeout, self.channel.send_artifact(&entry.job, &artifact))
            .await
        {
            Ok(res) => res,
            Err(_) => Err(TransportError::Unreachable(format!(
                "send timed out after {}s",
                self.cfg.send_timeout.as_secs()
            ))),
        };

        let err = match sent {
            Ok(()) => {
                store.mark_delivered(id, now)?;
                store.release_payload(id)?;
                self.shared.link.observe(true);
                report.delivered += 1;
                info!(job_id = id.get(), kind = %entry.job.kind, "delivered");
                return Ok(true);
            }
            Err(err) => err,
        };

        let attempts = entry.delivery_attempts.saturating_add(1);
        match decide_retry(&err, attempts, self.cfg.max_attempts, &self.cfg.backoff) {
            RetryDecision::RetryAfterSecs(delay) => {
                store.mark_pending_retry(id, retry_schedule(attempts, delay, now))?;
                report.retried += 1;
                warn!(job_id = id.get(), attempts, "delivery failed, retry in {delay}s: {err}");
            }
            RetryDecision::Fail { reason } => {
                store.mark_failed(id, &reason, attempts, now)?;
                report.failed += 1;
                warn!(job_id = id.get(), attempts, "delivery failed permanently: {reason}");
            }
        }

        if err.is_retryable() {
            self.shared.link.observe(false);
            report.channel_down = true;
            return Ok(false);
        }
        Ok(true)
    }
}
