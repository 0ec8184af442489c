use serde::{Deserialize, Serialize};

use crate::{
    errors::{InvalidTransition, PersistenceError},
    ids::JobId,
    model::*,
    time::EpochMs,
};

pub const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub origin: Origin,
    pub created_at: EpochMs,
    pub state: JobState,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind, origin: Origin, created_at: EpochMs) -> Self {
        Self { id, kind, origin, created_at, state: JobState::Requested }
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    /// Human readable origin of the fix, e.g. "IP address (approximate)".
    pub source: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub isp: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemInfoRecord {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
    pub collected_at: EpochMs,
}

/// Raw capture result handed back by a producer.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Photo { media_type: String, bytes: Vec<u8> },
    Location(LocationFix),
    SystemInfo(SystemInfoRecord),
}

impl Payload {
    pub fn kind(&self) -> JobKind {
        match self {
            Payload::Photo { .. } => JobKind::Photo,
            Payload::Location(_) => JobKind::Location,
            Payload::SystemInfo(_) => JobKind::SystemInfo,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Payload::Photo { media_type, .. } => media_type,
            Payload::Location(_) | Payload::SystemInfo(_) => JSON_MEDIA_TYPE,
        }
    }

    /// Bytes as they are written to the store.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Payload::Photo { bytes, .. } => Ok(bytes.clone()),
            Payload::Location(fix) => serde_json::to_vec(fix),
            Payload::SystemInfo(info) => serde_json::to_vec(info),
        }
    }

    pub fn decode(kind: JobKind, media_type: &str, bytes: Vec<u8>) -> Result<Self, PersistenceError> {
        let corrupt = |e: serde_json::Error| PersistenceError::Corrupt(format!("{kind} payload: {e}"));
        match kind {
            JobKind::Photo => Ok(Payload::Photo { media_type: media_type.to_string(), bytes }),
            JobKind::Location => serde_json::from_slice(&bytes).map(Payload::Location).map_err(corrupt),
            JobKind::SystemInfo => serde_json::from_slice(&bytes).map(Payload::SystemInfo).map_err(corrupt),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub job_id: JobId,
    pub payload: Payload,
    pub captured_at: EpochMs,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn new(job_id: JobId, payload: Payload, captured_at: EpochMs) -> serde_json::Result<Self> {
        let size_bytes = match &payload {
            Payload::Photo { bytes, .. } => bytes.len() as u64,
            other => other.encode()?.len() as u64,
        };
        Ok(Self { job_id, payload, captured_at, size_bytes })
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Persisted pairing of a job, its artifact and delivery bookkeeping.
///
/// `payload` is `None` once a delivered entry had its payload released.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub job: Job,
    pub payload: Option<Payload>,
    pub captured_at: EpochMs,
    pub size_bytes: u64,
    pub digest: String,
    pub status: EntryStatus,
    pub delivery_attempts: u32,
    pub last_attempt_at: Option<EpochMs>,
    pub next_attempt_at: EpochMs,
    pub failure_reason: Option<String>,
}

impl QueueEntry {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn artifact(&self) -> Option<Artifact> {
        self.payload.as_ref().map(|payload| Artifact {
            job_id: self.job.id,
            payload: payload.clone(),
            captured_at: self.captured_at,
            size_bytes: self.size_bytes,
        })
    }

    pub fn job_state(&self) -> JobState {
        self.status.job_state()
    }
}

/// Absolute values written by `mark_pending_retry`, so a repeated call after a
/// crash lands on the same row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    pub attempts: u32,
    pub last_attempt_at: EpochMs,
    pub next_attempt_at: EpochMs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtectionState {
    pub enabled: bool,
    pub last_changed_at: EpochMs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Bytes held by payloads still stored (delivered entries release theirs).
    pub held_bytes: u64,
}

impl QueueCounts {
    pub fn undelivered(&self) -> u64 {
        self.pending + self.in_flight
    }

    pub fn bump(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Pending => self.pending += 1,
            EntryStatus::InFlight => self.in_flight += 1,
            EntryStatus::Delivered => self.delivered += 1,
            EntryStatus::Failed => self.failed += 1,
        }
    }
}
