use guard_core::{
    Artifact, EntryStatus, EpochMs, Job, JobId, PersistenceError, ProtectionState, QueueCounts, QueueEntry,
    RetrySchedule, WorkerId,
};

pub type StoreResult<T> = Result<T, PersistenceError>;

/// What `recover` fixed up after an unclean shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// InFlight entries put back to Pending.
    pub reclaimed: u64,
    /// Delivered entries whose payload was still stored.
    pub payloads_released: u64,
}

/// Durable offline queue.
///
/// Status transitions are idempotent: values are absolute, terminal statuses
/// (Delivered, Failed) are never left, and unknown ids are a no-op.
pub trait QueueStore: Send + Sync {
    fn next_job_id(&self) -> StoreResult<JobId>;

    /// Persist a captured job. Enforces the byte cap afterwards by purging
    /// Failed history first, then Delivered rows still holding payloads.
    fn enqueue(&self, job: &Job, artifact: &Artifact, now: EpochMs) -> StoreResult<QueueEntry>;

    /// Claim up to `max_n` due Pending entries, oldest first. Claimed entries
    /// are InFlight when this returns; no two callers get the same entry.
    fn dequeue_batch(&self, max_n: usize, now: EpochMs) -> StoreResult<Vec<QueueEntry>>;

    fn mark_delivered(&self, id: JobId, now: EpochMs) -> StoreResult<()>;
    fn mark_failed(&self, id: JobId, reason: &str, attempts: u32, now: EpochMs) -> StoreResult<()>;
    fn mark_pending_retry(&self, id: JobId, retry: RetrySchedule) -> StoreResult<()>;

    /// InFlight back to Pending, attempts untouched.
    fn release_claim(&self, id: JobId) -> StoreResult<()>;

    /// Drop the payload of a Delivered entry. Never touches other statuses.
    fn release_payload(&self, id: JobId) -> StoreResult<()>;

    fn recover(&self) -> StoreResult<RecoveryReport>;

    fn counts(&self) -> StoreResult<QueueCounts>;
    fn entry(&self, id: JobId) -> StoreResult<Option<QueueEntry>>;
    fn list(&self, status: EntryStatus) -> StoreResult<Vec<QueueEntry>>;

    /// Single-owner lock for the delivery worker. Re-acquiring an owned lease
    /// renews it; an expired lease can be taken over.
    fn try_acquire_worker_lease(&self, owner: &WorkerId, ttl_ms: i64, now: EpochMs) -> StoreResult<bool>;
    fn release_worker_lease(&self, owner: &WorkerId) -> StoreResult<()>;
}

pub trait ProtectionStore: Send + Sync {
    fn load_protection(&self) -> StoreResult<Option<ProtectionState>>;
    fn save_protection(&self, state: &ProtectionState) -> StoreResult<()>;
}
