use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guard_channel::{InboundMessage, MemoryChannel};
use guard_core::{
    secs_to_ms, CaptureError, EntryStatus, JobId, JobKind, LocationFix, Origin, Payload, ProtectionState, WorkerId,
};
use guard_producer::{ArtifactProducer, SystemInfoProbe};
use guard_runtime::{
    monitor_tick, Agent, AgentSettings, DeliveryWorker, Dispatcher, JobOutcome, ProtectionController, Router, Shared,
    WorkerConfig, CORRUPT_PAYLOAD_REASON,
};
use guard_storage::{InMemoryStore, ProtectionStore, QueueStore};
use guard_storage_sqlite::SqliteStore;
use tempfile::tempdir;
use tokio::sync::watch;

const RECIPIENT: &str = "4242";

struct InstantProducer;

#[async_trait]
impl ArtifactProducer for InstantProducer {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        Ok(match kind {
            JobKind::Photo => Payload::Photo { media_type: "image/jpeg".into(), bytes: vec![0xFF, 0xD8, 0xFF, 0xE0] },
            JobKind::Location => Payload::Location(LocationFix {
                lat: 52.52,
                lon: 13.40,
                accuracy_m: None,
                source: "test".into(),
                ip: None,
                city: Some("Berlin".into()),
                region: None,
                country: Some("Germany".into()),
                isp: None,
                timezone: None,
            }),
            JobKind::SystemInfo => Payload::SystemInfo(SystemInfoProbe::collect()),
        })
    }
}

struct NoCamera;

#[async_trait]
impl ArtifactProducer for NoCamera {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        Err(CaptureError::Unavailable(kind))
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    channel: Arc<MemoryChannel>,
    shared: Shared,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(enabled: bool) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_store(store, enabled)
    }

    fn with_store(store: Arc<InMemoryStore>, enabled: bool) -> Self {
        Self::build(store, enabled, Arc::new(InstantProducer))
    }

    fn build(store: Arc<InMemoryStore>, enabled: bool, producer: Arc<dyn ArtifactProducer>) -> Self {
        let protection = Arc::new(ProtectionController::load(store.clone()).unwrap());
        if enabled {
            protection.enable(1).unwrap();
        }
        let shared = Shared::new(store.clone(), protection);
        let dispatcher = Dispatcher::new(shared.clone(), producer, vec![JobKind::SystemInfo]);
        Self { store, channel: Arc::new(MemoryChannel::new()), shared, dispatcher }
    }

    fn worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(self.shared.clone(), self.channel.clone(), WorkerConfig::default())
    }

    fn router(&self) -> Router {
        Router::new(
            self.shared.clone(),
            self.dispatcher.clone(),
            self.channel.clone(),
            RECIPIENT.to_string(),
            Duration::from_millis(10),
        )
    }

    async fn capture(&self, kind: JobKind) -> JobId {
        let admission = self.dispatcher.trigger(kind, Origin::RemoteCommand).unwrap();
        match admission.outcome().await {
            Some(JobOutcome::Queued(id)) => id,
            other => panic!("capture not queued: {other:?}"),
        }
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_no_loss_under_disconnection() {
    let h = Harness::new(true);
    h.channel.set_reachable(false);
    let mut ids = Vec::new();
    for kind in [JobKind::Photo, JobKind::Location, JobKind::SystemInfo, JobKind::Photo, JobKind::Location] {
        ids.push(h.capture(kind).await);
    }

    let worker = h.worker();
    let t0 = now() + 1_000;
    let report = worker.run_cycle(t0).await.unwrap();
    assert!(report.channel_down);
    assert_eq!((report.claimed, report.retried, report.released), (5, 1, 4));
    assert_eq!(h.store.counts().unwrap().pending, 5);

    h.channel.set_reachable(true);
    let mut t = t0;
    while h.store.counts().unwrap().undelivered() > 0 {
        t += secs_to_ms(600);
        worker.run_cycle(t).await.unwrap();
    }
    let counts = h.store.counts().unwrap();
    assert_eq!((counts.delivered, counts.failed), (5, 0));
    let mut delivered = h.channel.delivered_ids();
    delivered.sort();
    assert_eq!(delivered, ids);
}

#[tokio::test]
async fn test_delivery_preserves_creation_order() {
    let h = Harness::new(true);
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.capture(JobKind::SystemInfo).await);
    }
    let report = h.worker().run_cycle(now() + 1_000).await.unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(h.channel.delivered_ids(), ids);
    assert_eq!(h.store.counts().unwrap().held_bytes, 0);
}

#[tokio::test]
async fn test_unreachable_backoff_then_failed() {
    let h = Harness::new(true);
    let id = h.capture(JobKind::Photo).await;
    h.channel.set_reachable(false);
    let worker = h.worker();

    let mut t = now() + 1_000;
    let mut deltas = Vec::new();
    for _ in 0..4 {
        worker.run_cycle(t).await.unwrap();
        let entry = h.store.entry(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        deltas.push(entry.next_attempt_at - t);
        // not due yet: nothing claimed
        assert_eq!(worker.run_cycle(entry.next_attempt_at - 1).await.unwrap().claimed, 0);
        t = entry.next_attempt_at;
    }
    assert_eq!(deltas, vec![5_000, 10_000, 20_000, 40_000]);

    worker.run_cycle(t).await.unwrap();
    let entry = h.store.entry(id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.delivery_attempts, 5);
    assert!(entry.failure_reason.unwrap().contains("gave up after 5 attempts"));
}

#[tokio::test]
async fn test_rejected_fails_without_stopping_batch() {
    let h = Harness::new(true);
    let photo = h.capture(JobKind::Photo).await;
    let info = h.capture(JobKind::SystemInfo).await;
    h.channel.reject_kind(JobKind::Photo);

    let report = h.worker().run_cycle(now() + 1_000).await.unwrap();
    assert_eq!((report.failed, report.delivered, report.channel_down), (1, 1, false));
    let failed = h.store.entry(photo).unwrap().unwrap();
    assert_eq!(failed.status, EntryStatus::Failed);
    assert_eq!(failed.delivery_attempts, 1);
    assert_eq!(h.channel.delivered_ids(), vec![info]);
}

#[tokio::test]
async fn test_channel_drop_mid_batch_keeps_order_and_attempts() {
    let h = Harness::new(true);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.capture(JobKind::SystemInfo).await);
    }
    h.channel.unreachable_after(1);

    let report = h.worker().run_cycle(now() + 1_000).await.unwrap();
    assert_eq!((report.delivered, report.retried, report.released), (1, 1, 1));
    assert_eq!(h.store.entry(ids[1]).unwrap().unwrap().delivery_attempts, 1);
    let untouched = h.store.entry(ids[2]).unwrap().unwrap();
    assert_eq!((untouched.status, untouched.delivery_attempts), (EntryStatus::Pending, 0));
    assert_eq!(h.shared.link.connected(), Some(false));
}

#[tokio::test]
async fn test_single_worker() {
    let h = Harness::new(true);
    let (tx, rx) = watch::channel(false);
    let first = h.worker().start(rx.clone());
    h.capture(JobKind::SystemInfo).await;
    wait_until("first worker delivers", || h.channel.delivered_ids().len() == 1).await;

    // the lease is live, so a second worker is a no-op
    let second = h.worker();
    let report = second.run_cycle(now()).await.unwrap();
    assert!(report.lease_lost);
    assert_eq!(report.claimed, 0);
    assert!(second.run_once(now()).await.unwrap().is_none());

    tx.send(true).unwrap();
    first.await.unwrap();
    // lease released on shutdown
    assert!(h.worker().run_once(now()).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_takes_over_stale_lease() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("guard.db")).unwrap());
    store.save_protection(&ProtectionState { enabled: true, last_changed_at: 1 }).unwrap();
    // left behind by a process that was killed before it could release it
    assert!(store.try_acquire_worker_lease(&WorkerId::new(), 300, now()).unwrap());

    let channel = Arc::new(MemoryChannel::new());
    let mut settings = settings(vec![JobKind::SystemInfo]);
    settings.worker.interval = Duration::from_millis(50);
    let agent = Agent::new(store.clone(), store.clone(), channel.clone(), Arc::new(InstantProducer), settings).unwrap();

    let (tx, rx) = watch::channel(false);
    let tasks = agent.start(rx).unwrap();
    wait_until("startup capture delivered", || channel.delivered_ids().len() == 1).await;
    let counts = store.counts().unwrap();
    assert_eq!((counts.pending, counts.delivered), (0, 1));

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), tasks.join()).await.unwrap();
}

#[tokio::test]
async fn test_gate_blocks_startup_but_status_works() {
    let h = Harness::new(false);
    let admissions = h.dispatcher.fire_startup().unwrap();
    assert!(admissions.iter().all(|a| a.job_id().is_none()));
    assert_eq!(h.store.counts().unwrap(), Default::default());

    let reply = h
        .router()
        .handle(&InboundMessage { sender: RECIPIENT.into(), text: "/status".into() })
        .await
        .unwrap();
    assert!(reply.contains("Protection: OFF"));
    assert_eq!(h.channel.texts(), vec![reply]);
    assert_eq!(h.store.counts().unwrap().pending, 0);
}

#[tokio::test]
async fn test_router_ignores_strangers_and_answers_in_order() {
    let h = Harness::new(true);
    let router = h.router();
    h.channel.push_inbound("999", "/photo");
    h.channel.push_inbound(RECIPIENT, "/photo");
    h.channel.push_inbound(RECIPIENT, "rm -rf /");
    h.channel.push_inbound(RECIPIENT, "/help");

    assert_eq!(router.poll_once().await.unwrap(), 4);
    let texts = h.channel.texts();
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("Capturing photo"));
    assert!(texts[1].starts_with("Unknown command: rm -rf /"));
    assert!(texts[2].contains("/status"));

    wait_until("remote capture queued", || h.store.counts().unwrap().pending == 1).await;
    let pending = h.store.list(EntryStatus::Pending).unwrap();
    assert_eq!(pending[0].job.origin, Origin::RemoteCommand);
}

#[tokio::test]
async fn test_remote_capture_failure_is_reported() {
    let h = Harness::build(Arc::new(InMemoryStore::new()), true, Arc::new(NoCamera));
    let router = h.router();
    let ask = |text: &str| InboundMessage { sender: RECIPIENT.into(), text: text.into() };

    let reply = router.handle(&ask("/photo")).await.unwrap();
    assert!(reply.starts_with("Capturing photo"));
    wait_until("failure notice", || h.channel.texts().len() == 2).await;
    let notice = &h.channel.texts()[1];
    assert!(notice.ends_with("failed: no photo capability configured"), "{notice}");

    let status = router.handle(&ask("/status")).await.unwrap();
    assert!(status.contains("0 pending"));
    assert!(status.contains("Capture failures: 1"));
    assert!(status.contains("no photo capability configured"));
}

#[tokio::test]
async fn test_failed_reply_does_not_stop_router() {
    let h = Harness::new(true);
    let router = h.router();
    h.channel.set_reachable(false);
    let reply = router.handle(&InboundMessage { sender: RECIPIENT.into(), text: "/help".into() }).await;
    assert!(reply.is_some());
    assert!(h.channel.texts().is_empty());
}

#[tokio::test]
async fn test_crash_recovery_reclaims_in_flight() {
    let store = Arc::new(InMemoryStore::new());
    {
        let h = Harness::with_store(store.clone(), true);
        h.capture(JobKind::SystemInfo).await;
        h.capture(JobKind::SystemInfo).await;
        assert_eq!(store.dequeue_batch(2, now()).unwrap().len(), 2);
    }
    assert_eq!(store.counts().unwrap().in_flight, 2);

    let agent = Agent::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryChannel::new()),
        Arc::new(InstantProducer),
        settings(vec![]),
    )
    .unwrap();
    let counts = agent.shared().store.counts().unwrap();
    assert_eq!((counts.pending, counts.in_flight), (2, 0));
    assert!(agent.shared().protection.is_enabled());
}

#[tokio::test]
async fn test_corrupt_payload_marks_failed() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("guard.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let protection = Arc::new(ProtectionController::load(store.clone()).unwrap());
    protection.enable(1).unwrap();
    let shared = Shared::new(store.clone(), protection);
    let dispatcher = Dispatcher::new(shared.clone(), Arc::new(InstantProducer), vec![]);
    let admission = dispatcher.trigger(JobKind::SystemInfo, Origin::ManualLocal).unwrap();
    let Some(JobOutcome::Queued(id)) = admission.outcome().await else { panic!("not queued") };

    let raw = rusqlite::Connection::open(&db_path).unwrap();
    raw.execute("UPDATE queue_entries SET payload = X'7B7D' WHERE job_id = ?1", [id.get()]).unwrap();

    let channel = Arc::new(MemoryChannel::new());
    let worker = DeliveryWorker::new(shared, channel.clone(), WorkerConfig::default());
    let report = worker.run_cycle(now()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(channel.send_calls(), 0);
    let entry = store.entry(id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.failure_reason.as_deref(), Some(CORRUPT_PAYLOAD_REASON));
}

#[tokio::test]
async fn test_link_restore_wakes_worker() {
    let h = Harness::new(true);
    h.channel.set_reachable(false);
    monitor_tick(&h.shared, h.channel.as_ref(), Duration::from_secs(1)).await;
    assert_eq!(h.shared.link.connected(), Some(false));

    h.channel.set_reachable(true);
    monitor_tick(&h.shared, h.channel.as_ref(), Duration::from_secs(1)).await;
    assert_eq!(h.shared.link.connected(), Some(true));
    tokio::time::timeout(Duration::from_secs(1), h.shared.wake.notified()).await.unwrap();
}

#[tokio::test]
async fn test_monitor_picks_up_cli_protection_change() {
    let h = Harness::new(false);
    h.store.save_protection(&ProtectionState { enabled: true, last_changed_at: 9 }).unwrap();
    monitor_tick(&h.shared, h.channel.as_ref(), Duration::from_secs(1)).await;
    assert!(h.shared.protection.is_enabled());
}

#[tokio::test]
async fn test_persistence_error_lands_in_status() {
    let h = Harness::new(true);
    let (tx, rx) = watch::channel(false);
    let handle = h.worker().start(rx);
    h.store.set_fail_writes(true);
    h.shared.wake.notify_one();
    wait_until("cycle error recorded", || h.shared.diagnostics.last_error().is_some()).await;

    h.store.set_fail_writes(false);
    let snapshot = h.shared.snapshot(now()).unwrap();
    assert!(snapshot.render().contains("Last storage error"));
    tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    store.save_protection(&ProtectionState { enabled: true, last_changed_at: 1 }).unwrap();
    let channel = Arc::new(MemoryChannel::new());
    let agent = Agent::new(
        store.clone(),
        store.clone(),
        channel.clone(),
        Arc::new(InstantProducer),
        settings(vec![JobKind::SystemInfo, JobKind::Photo, JobKind::Location]),
    )
    .unwrap();

    let (tx, rx) = watch::channel(false);
    let tasks = agent.start(rx).unwrap();
    assert_eq!(tasks.startup.len(), 3);

    wait_until("startup captures delivered", || channel.delivered_ids().len() == 3).await;
    let sent = channel.sent_artifacts();
    assert!(sent.iter().all(|a| a.origin == Origin::Startup));

    channel.push_inbound(RECIPIENT, "/status");
    wait_until("status reply", || channel.texts().iter().any(|t| t.contains("3 delivered"))).await;

    channel.push_inbound(RECIPIENT, "/location");
    wait_until("remote capture delivered", || channel.delivered_ids().len() == 4).await;

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), tasks.join()).await.unwrap();
}

fn settings(startup_kinds: Vec<JobKind>) -> AgentSettings {
    AgentSettings {
        worker: WorkerConfig::default(),
        probe_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        startup_kinds,
        recipient: RECIPIENT.to_string(),
    }
}

fn now() -> i64 {
    guard_core::now_ms()
}
