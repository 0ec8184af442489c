use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use guard_core::{
    payload_digest, Artifact, EntryStatus, EpochMs, Job, JobId, JobState, PersistenceError, ProtectionState,
    QueueCounts, QueueEntry, RetrySchedule, WorkerId,
};

use crate::traits::{ProtectionStore, QueueStore, RecoveryReport, StoreResult};

/// In-memory store for tests. Not durable, but honours every queue invariant,
/// and can be told to fail writes to exercise persistence error paths.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    byte_cap: Option<u64>,
}

#[derive(Default)]
struct Inner {
    seq: i64,
    entries: BTreeMap<JobId, QueueEntry>,
    lease: Option<(WorkerId, EpochMs)>,
    protection: Option<ProtectionState>,
    fail_writes: bool,
}

impl Inner {
    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes {
            return Err(anyhow!("simulated write failure").into());
        }
        Ok(())
    }

    fn held_bytes(&self) -> u64 {
        self.entries.values().filter(|e| e.payload.is_some()).map(|e| e.size_bytes).sum()
    }

    fn oldest_holding(&self, status: EntryStatus) -> Option<JobId> {
        self.entries
            .values()
            .filter(|e| e.status == status && e.payload.is_some())
            .min_by_key(|e| (e.job.created_at, e.job.id))
            .map(|e| e.job.id)
    }

    fn enforce_cap(&mut self, cap: u64) {
        while self.held_bytes() > cap {
            let victim = self
                .oldest_holding(EntryStatus::Failed)
                .or_else(|| self.oldest_holding(EntryStatus::Delivered));
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_byte_cap(mut self, cap: u64) -> Self {
        self.byte_cap = Some(cap);
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| PersistenceError::Backend(anyhow!("in-memory store mutex poisoned")))
    }
}

impl QueueStore for InMemoryStore {
    fn next_job_id(&self) -> StoreResult<JobId> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        inner.seq += 1;
        Ok(JobId(inner.seq))
    }

    fn enqueue(&self, job: &Job, artifact: &Artifact, now: EpochMs) -> StoreResult<QueueEntry> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if inner.entries.contains_key(&job.id) {
            return Err(anyhow!("job {} is already queued", job.id).into());
        }
        let encoded = artifact
            .payload
            .encode()
            .map_err(|e| PersistenceError::Corrupt(format!("encode job {}: {e}", job.id)))?;

        let mut queued = job.clone();
        queued.state = JobState::Queued;
        let entry = QueueEntry {
            job: queued,
            payload: Some(artifact.payload.clone()),
            captured_at: artifact.captured_at,
            size_bytes: encoded.len() as u64,
            digest: payload_digest(&encoded),
            status: EntryStatus::Pending,
            delivery_attempts: 0,
            last_attempt_at: None,
            next_attempt_at: now,
            failure_reason: None,
        };
        inner.entries.insert(job.id, entry.clone());
        if let Some(cap) = self.byte_cap {
            inner.enforce_cap(cap);
        }
        Ok(entry)
    }

    fn dequeue_batch(&self, max_n: usize, now: EpochMs) -> StoreResult<Vec<QueueEntry>> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        let mut due: Vec<(EpochMs, JobId)> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending && e.next_attempt_at <= now)
            .map(|e| (e.job.created_at, e.job.id))
            .collect();
        due.sort();
        due.truncate(max_n);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(e) = inner.entries.get_mut(&id) {
                e.status = EntryStatus::InFlight;
                claimed.push(e.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_delivered(&self, id: JobId, now: EpochMs) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if let Some(e) = inner.entries.get_mut(&id) {
            if !e.status.is_terminal() {
                e.status = EntryStatus::Delivered;
                e.job.state = JobState::Delivered;
                e.last_attempt_at = Some(now);
                e.failure_reason = None;
            }
        }
        Ok(())
    }

    fn mark_failed(&self, id: JobId, reason: &str, attempts: u32, now: EpochMs) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if let Some(e) = inner.entries.get_mut(&id) {
            if !e.status.is_terminal() {
                e.status = EntryStatus::Failed;
                e.job.state = JobState::Failed;
                e.delivery_attempts = e.delivery_attempts.max(attempts);
                e.last_attempt_at = Some(now);
                e.failure_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    fn mark_pending_retry(&self, id: JobId, retry: RetrySchedule) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if let Some(e) = inner.entries.get_mut(&id) {
            if !e.status.is_terminal() {
                e.status = EntryStatus::Pending;
                e.delivery_attempts = e.delivery_attempts.max(retry.attempts);
                e.last_attempt_at = Some(retry.last_attempt_at);
                e.next_attempt_at = retry.next_attempt_at;
            }
        }
        Ok(())
    }

    fn release_claim(&self, id: JobId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if let Some(e) = inner.entries.get_mut(&id) {
            if e.status == EntryStatus::InFlight {
                e.status = EntryStatus::Pending;
            }
        }
        Ok(())
    }

    fn release_payload(&self, id: JobId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        if let Some(e) = inner.entries.get_mut(&id) {
            if e.status == EntryStatus::Delivered {
                e.payload = None;
            }
        }
        Ok(())
    }

    fn recover(&self) -> StoreResult<RecoveryReport> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        let mut report = RecoveryReport::default();
        for e in inner.entries.values_mut() {
            match e.status {
                EntryStatus::InFlight => {
                    e.status = EntryStatus::Pending;
                    report.reclaimed += 1;
                }
                EntryStatus::Delivered if e.payload.is_some() => {
                    e.payload = None;
                    report.payloads_released += 1;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    fn counts(&self) -> StoreResult<QueueCounts> {
        let inner = self.lock()?;
        let mut counts = QueueCounts::default();
        for e in inner.entries.values() {
            counts.bump(e.status);
        }
        counts.held_bytes = inner.held_bytes();
        Ok(counts)
    }

    fn entry(&self, id: JobId) -> StoreResult<Option<QueueEntry>> {
        Ok(self.lock()?.entries.get(&id).cloned())
    }

    fn list(&self, status: EntryStatus) -> StoreResult<Vec<QueueEntry>> {
        let inner = self.lock()?;
        let mut out: Vec<QueueEntry> = inner.entries.values().filter(|e| e.status == status).cloned().collect();
        out.sort_by_key(|e| (e.job.created_at, e.job.id));
        Ok(out)
    }

    fn try_acquire_worker_lease(&self, owner: &WorkerId, ttl_ms: i64, now: EpochMs) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        let free = match &inner.lease {
            None => true,
            Some((holder, expires_at)) => holder == owner || *expires_at <= now,
        };
        if free {
            inner.lease = Some((owner.clone(), now + ttl_ms));
        }
        Ok(free)
    }

    fn release_worker_lease(&self, owner: &WorkerId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if matches!(&inner.lease, Some((holder, _)) if holder == owner) {
            inner.lease = None;
        }
        Ok(())
    }
}

impl ProtectionStore for InMemoryStore {
    fn load_protection(&self) -> StoreResult<Option<ProtectionState>> {
        Ok(self.lock()?.protection)
    }

    fn save_protection(&self, state: &ProtectionState) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.check_writable()?;
        inner.protection = Some(*state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guard_core::{JobKind, Origin, Payload};

    fn photo(store: &InMemoryStore, created_at: EpochMs, size: usize) -> JobId {
        let id = store.next_job_id().unwrap();
        let job = Job::new(id, JobKind::Photo, Origin::Startup, created_at);
        let payload = Payload::Photo { media_type: "image/jpeg".into(), bytes: vec![0xAB; size] };
        let artifact = Artifact::new(id, payload, created_at).unwrap();
        store.enqueue(&job, &artifact, created_at).unwrap();
        id
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert_eq!(store.counts().unwrap(), QueueCounts::default());
        assert!(store.load_protection().unwrap().is_none());
    }

    #[test]
    fn test_job_ids_increase() {
        let store = InMemoryStore::new();
        let a = store.next_job_id().unwrap();
        let b = store.next_job_id().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let store = InMemoryStore::new();
        let id = photo(&store, 1, 4);
        let job = Job::new(id, JobKind::Photo, Origin::Startup, 1);
        let artifact = Artifact::new(id, Payload::Photo { media_type: "image/jpeg".into(), bytes: vec![1] }, 1).unwrap();
        assert!(store.enqueue(&job, &artifact, 1).is_err());
        assert_eq!(store.counts().unwrap().pending, 1);
    }

    #[test]
    fn test_dequeue_claims_once() {
        let store = InMemoryStore::new();
        photo(&store, 1, 4);
        photo(&store, 2, 4);
        let first = store.dequeue_batch(10, 10).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.status == EntryStatus::InFlight));
        assert!(store.dequeue_batch(10, 10).unwrap().is_empty());
    }

    #[test]
    fn test_failed_writes_surface() {
        let store = InMemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.next_job_id(), Err(PersistenceError::Backend(_))));
        store.set_fail_writes(false);
        assert!(store.next_job_id().is_ok());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let store = InMemoryStore::new();
        let id = photo(&store, 1, 4);
        store.dequeue_batch(1, 1).unwrap();
        store.mark_failed(id, "rejected", 1, 2).unwrap();
        store.mark_delivered(id, 3).unwrap();
        store
            .mark_pending_retry(id, RetrySchedule { attempts: 2, last_attempt_at: 3, next_attempt_at: 8 })
            .unwrap();
        let e = store.entry(id).unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Failed);
        assert_eq!(e.delivery_attempts, 1);
    }

    #[test]
    fn test_lease_is_exclusive_until_expiry() {
        let store = InMemoryStore::new();
        let a = WorkerId::from_str("a");
        let b = WorkerId::from_str("b");
        assert!(store.try_acquire_worker_lease(&a, 100, 0).unwrap());
        assert!(!store.try_acquire_worker_lease(&b, 100, 50).unwrap());
        assert!(store.try_acquire_worker_lease(&a, 100, 60).unwrap());
        assert!(store.try_acquire_worker_lease(&b, 100, 200).unwrap());
        store.release_worker_lease(&a).unwrap();
        assert!(!store.try_acquire_worker_lease(&a, 100, 210).unwrap());
    }

    #[test]
    fn test_cap_purges_failed_before_pending() {
        let store = InMemoryStore::new().with_byte_cap(250);
        let old_failed = photo(&store, 1, 100);
        let pending = photo(&store, 2, 100);
        store.dequeue_batch(1, 5).unwrap();
        store.mark_failed(old_failed, "rejected", 1, 5).unwrap();

        photo(&store, 3, 100);
        assert!(store.entry(old_failed).unwrap().is_none());
        assert_eq!(store.entry(pending).unwrap().unwrap().status, EntryStatus::Pending);
        assert_eq!(store.counts().unwrap().pending, 2);
    }
}
