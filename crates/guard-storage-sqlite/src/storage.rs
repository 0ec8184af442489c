use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{error, warn};

use guard_core::{
    payload_digest, Artifact, EntryStatus, EpochMs, Job, JobId, JobKind, Origin, Payload, PersistenceError,
    ProtectionState, QueueCounts, QueueEntry, RetrySchedule, WorkerId,
};
use guard_storage::{ProtectionStore, QueueStore, RecoveryReport, StoreResult};

const ENTRY_COLUMNS: &str = "job_id, kind, origin, created_at, captured_at, media_type, payload, size_bytes, digest, \
     status, delivery_attempts, last_attempt_at, next_attempt_at, failure_reason";

const PROTECTION_KEY: &str = "protection";

/// Durable queue + settings in a single SQLite file.
///
/// Every status change is a single guarded UPDATE, the batch claim is one
/// IMMEDIATE transaction, so two workers (even in two processes) never claim
/// the same entry.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    byte_cap: Option<u64>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn), byte_cap: None })
    }

    pub fn with_byte_cap(mut self, cap: u64) -> Self {
        self.byte_cap = Some(cap);
        self
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Run a single-row status UPDATE guarded by its WHERE clause.
    fn update(&self, what: &str, id: JobId, sql: &str, args: impl rusqlite::Params) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(sql, args).with_context(|| format!("{what} job {id}"))?;
        Ok(())
    }
}

struct RawEntry {
    job_id: i64,
    kind: String,
    origin: String,
    created_at: i64,
    captured_at: i64,
    media_type: String,
    payload: Option<Vec<u8>>,
    size_bytes: i64,
    digest: String,
    status: String,
    delivery_attempts: i64,
    last_attempt_at: Option<i64>,
    next_attempt_at: i64,
    failure_reason: Option<String>,
}

impl RawEntry {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: r.get(0)?,
            kind: r.get(1)?,
            origin: r.get(2)?,
            created_at: r.get(3)?,
            captured_at: r.get(4)?,
            media_type: r.get(5)?,
            payload: r.get(6)?,
            size_bytes: r.get(7)?,
            digest: r.get(8)?,
            status: r.get(9)?,
            delivery_attempts: r.get(10)?,
            last_attempt_at: r.get(11)?,
            next_attempt_at: r.get(12)?,
            failure_reason: r.get(13)?,
        })
    }

    /// Unreadable metadata is an error; an unreadable payload only drops the
    /// payload so the worker can fail that one entry instead of the whole cycle.
    fn into_entry(self) -> StoreResult<QueueEntry> {
        let job_id = self.job_id;
        let corrupt = |what: &str, value: &str| PersistenceError::Corrupt(format!("job {job_id}: unknown {what} '{value}'"));
        let kind: JobKind = self.kind.parse().map_err(|_| corrupt("kind", &self.kind))?;
        let origin = Origin::parse(&self.origin).ok_or_else(|| corrupt("origin", &self.origin))?;
        let status = EntryStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?;

        let payload = match self.payload {
            None => None,
            Some(bytes) if payload_digest(&bytes) != self.digest => {
                error!(job_id, "stored payload does not match its digest");
                None
            }
            Some(bytes) => match Payload::decode(kind, &self.media_type, bytes) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!(job_id, "stored payload unreadable: {e}");
                    None
                }
            },
        };

        Ok(QueueEntry {
            job: Job { id: JobId(job_id), kind, origin, created_at: self.created_at, state: status.job_state() },
            payload,
            captured_at: self.captured_at,
            size_bytes: self.size_bytes.max(0) as u64,
            digest: self.digest,
            status,
            delivery_attempts: self.delivery_attempts.max(0) as u32,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
            failure_reason: self.failure_reason,
        })
    }
}

fn held_bytes(conn: &Connection) -> anyhow::Result<u64> {
    let held: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM queue_entries WHERE payload IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(held.max(0) as u64)
}

/// Purge history until held payload bytes fit the cap: oldest Failed first,
/// then oldest Delivered rows still holding payloads. Never Pending/InFlight.
fn enforce_cap(conn: &Connection, cap: u64) -> anyhow::Result<(u64, u64)> {
    let mut purged = 0;
    loop {
        let held = held_bytes(conn)?;
        if held <= cap {
            return Ok((purged, held));
        }
        let mut victim = None;
        for status in [EntryStatus::Failed, EntryStatus::Delivered] {
            victim = conn
                .query_row(
                    "SELECT job_id FROM queue_entries WHERE status=?1 AND payload IS NOT NULL
                     ORDER BY created_at, job_id LIMIT 1",
                    params![status.as_str()],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?;
            if victim.is_some() {
                break;
            }
        }
        match victim {
            Some(job_id) => {
                conn.execute("DELETE FROM queue_entries WHERE job_id=?1", params![job_id])?;
                purged += 1;
            }
            None => return Ok((purged, held)),
        }
    }
}

impl QueueStore for SqliteStore {
    fn next_job_id(&self) -> StoreResult<JobId> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin job id allocation")?;
        tx.execute("UPDATE job_sequence SET last_id = last_id + 1 WHERE id = 1", [])
            .context("bump job sequence")?;
        let id: i64 = tx
            .query_row("SELECT last_id FROM job_sequence WHERE id = 1", [], |r| r.get(0))
            .context("read job sequence")?;
        tx.commit().context("commit job id allocation")?;
        Ok(JobId(id))
    }

    fn enqueue(&self, job: &Job, artifact: &Artifact, now: EpochMs) -> StoreResult<QueueEntry> {
        let encoded = artifact
            .payload
            .encode()
            .map_err(|e| PersistenceError::Corrupt(format!("encode job {}: {e}", job.id)))?;
        let digest = payload_digest(&encoded);
        let size_bytes = encoded.len() as u64;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin enqueue")?;
        tx.execute(
            "INSERT INTO queue_entries(job_id, kind, origin, created_at, captured_at, media_type, payload, size_bytes,
                                       digest, status, delivery_attempts, last_attempt_at, next_attempt_at, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, NULL, ?10, NULL)",
            params![
                job.id.get(),
                job.kind.as_str(),
                job.origin.as_str(),
                job.created_at,
                artifact.captured_at,
                artifact.payload.media_type(),
                encoded,
                size_bytes as i64,
                digest,
                now,
            ],
        )
        .with_context(|| format!("insert queue entry {}", job.id))?;

        if let Some(cap) = self.byte_cap {
            let (purged, held) = enforce_cap(&tx, cap).context("enforce queue byte cap")?;
            if purged > 0 {
                warn!(purged, held, cap, "queue over byte cap, purged oldest history");
            }
            if held > cap {
                warn!(held, cap, "queue over byte cap with only undelivered entries left");
            }
        }
        tx.commit().with_context(|| format!("commit queue entry {}", job.id))?;

        let mut queued = job.clone();
        queued.state = EntryStatus::Pending.job_state();
        Ok(QueueEntry {
            job: queued,
            payload: Some(artifact.payload.clone()),
            captured_at: artifact.captured_at,
            size_bytes,
            digest,
            status: EntryStatus::Pending,
            delivery_attempts: 0,
            last_attempt_at: None,
            next_attempt_at: now,
            failure_reason: None,
        })
    }

    fn dequeue_batch(&self, max_n: usize, now: EpochMs) -> StoreResult<Vec<QueueEntry>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin claim")?;
        let raws = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM queue_entries
                     WHERE status='pending' AND next_attempt_at <= ?1
                     ORDER BY created_at, job_id LIMIT ?2"
                ))
                .context("prepare claim query")?;
            let rows = stmt
                .query_map(params![now, max_n as i64], RawEntry::from_row)
                .context("query due entries")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("read due entries")?
        };
        for raw in &raws {
            tx.execute(
                "UPDATE queue_entries SET status='in_flight' WHERE job_id=?1 AND status='pending'",
                params![raw.job_id],
            )
            .with_context(|| format!("claim job {}", raw.job_id))?;
        }
        tx.commit().context("commit claim")?;

        raws.into_iter()
            .map(|mut raw| {
                raw.status = EntryStatus::InFlight.as_str().to_string();
                raw.into_entry()
            })
            .collect()
    }

    fn mark_delivered(&self, id: JobId, now: EpochMs) -> StoreResult<()> {
        self.update(
            "mark delivered",
            id,
            "UPDATE queue_entries SET status='delivered', last_attempt_at=?2, failure_reason=NULL
             WHERE job_id=?1 AND status IN ('pending', 'in_flight')",
            params![id.get(), now],
        )
    }

    fn mark_failed(&self, id: JobId, reason: &str, attempts: u32, now: EpochMs) -> StoreResult<()> {
        self.update(
            "mark failed",
            id,
            "UPDATE queue_entries
             SET status='failed', delivery_attempts=MAX(delivery_attempts, ?2), last_attempt_at=?3, failure_reason=?4
             WHERE job_id=?1 AND status IN ('pending', 'in_flight')",
            params![id.get(), attempts as i64, now, reason],
        )
    }

    fn mark_pending_retry(&self, id: JobId, retry: RetrySchedule) -> StoreResult<()> {
        self.update(
            "schedule retry for",
            id,
            "UPDATE queue_entries
             SET status='pending', delivery_attempts=MAX(delivery_attempts, ?2), last_attempt_at=?3, next_attempt_at=?4
             WHERE job_id=?1 AND status IN ('pending', 'in_flight')",
            params![id.get(), retry.attempts as i64, retry.last_attempt_at, retry.next_attempt_at],
        )
    }

    fn release_claim(&self, id: JobId) -> StoreResult<()> {
        self.update(
            "release claim on",
            id,
            "UPDATE queue_entries SET status='pending' WHERE job_id=?1 AND status='in_flight'",
            params![id.get()],
        )
    }

    fn release_payload(&self, id: JobId) -> StoreResult<()> {
        self.update(
            "release payload of",
            id,
            "UPDATE queue_entries SET payload=NULL WHERE job_id=?1 AND status='delivered'",
            params![id.get()],
        )
    }

    fn recover(&self) -> StoreResult<RecoveryReport> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin recovery")?;
        let reclaimed = tx
            .execute("UPDATE queue_entries SET status='pending' WHERE status='in_flight'", [])
            .context("reclaim in-flight entries")?;
        let released = tx
            .execute(
                "UPDATE queue_entries SET payload=NULL WHERE status='delivered' AND payload IS NOT NULL",
                [],
            )
            .context("release delivered payloads")?;
        tx.commit().context("commit recovery")?;
        Ok(RecoveryReport { reclaimed: reclaimed as u64, payloads_released: released as u64 })
    }

    fn counts(&self) -> StoreResult<QueueCounts> {
        let conn = self.conn()?;
        let mut counts = QueueCounts::default();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")
            .context("prepare counts")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .context("query counts")?;
        for row in rows {
            let (status, n) = row.context("read counts")?;
            let n = n.max(0) as u64;
            match EntryStatus::parse(&status) {
                Some(EntryStatus::Pending) => counts.pending = n,
                Some(EntryStatus::InFlight) => counts.in_flight = n,
                Some(EntryStatus::Delivered) => counts.delivered = n,
                Some(EntryStatus::Failed) => counts.failed = n,
                None => return Err(PersistenceError::Corrupt(format!("unknown status '{status}'"))),
            }
        }
        counts.held_bytes = held_bytes(&conn).context("sum held bytes")?;
        Ok(counts)
    }

    fn entry(&self, id: JobId) -> StoreResult<Option<QueueEntry>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE job_id=?1"),
                params![id.get()],
                RawEntry::from_row,
            )
            .optional()
            .with_context(|| format!("load job {id}"))?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn list(&self, status: EntryStatus) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE status=?1 ORDER BY created_at, job_id"
            ))
            .context("prepare list")?;
        let raws = stmt
            .query_map(params![status.as_str()], RawEntry::from_row)
            .context("query entries")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read entries")?;
        raws.into_iter().map(RawEntry::into_entry).collect()
    }

    fn try_acquire_worker_lease(&self, owner: &WorkerId, ttl_ms: i64, now: EpochMs) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO worker_lease(id, owner, expires_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET owner=excluded.owner, expires_at=excluded.expires_at
                 WHERE worker_lease.owner = excluded.owner OR worker_lease.expires_at <= ?3",
                params![owner.as_str(), now + ttl_ms, now],
            )
            .context("acquire worker lease")?;
        Ok(changed == 1)
    }

    fn release_worker_lease(&self, owner: &WorkerId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM worker_lease WHERE id=1 AND owner=?1", params![owner.as_str()])
            .context("release worker lease")?;
        Ok(())
    }
}

impl ProtectionStore for SqliteStore {
    fn load_protection(&self) -> StoreResult<Option<ProtectionState>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key=?1", params![PROTECTION_KEY], |r| r.get(0))
            .optional()
            .context("load protection state")?;
        value
            .map(|v| {
                serde_json::from_str(&v).map_err(|e| PersistenceError::Corrupt(format!("protection state: {e}")))
            })
            .transpose()
    }

    fn save_protection(&self, state: &ProtectionState) -> StoreResult<()> {
        let value = serde_json::to_string(state).context("serialize protection state")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![PROTECTION_KEY, value],
        )
        .context("save protection state")?;
        Ok(())
    }
}
