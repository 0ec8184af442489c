use std::sync::Arc;

use guard_core::{now_ms, Artifact, CaptureError, Job, JobId, JobKind, JobState, Origin, PersistenceError};
use guard_producer::ArtifactProducer;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::Shared;

/// Final word on a single admitted job, as seen by whoever triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Queued(JobId),
    CaptureFailed { job_id: JobId, error: CaptureError },
    /// Protection was switched off before capture started.
    Dropped(JobId),
    /// The capture succeeded but could not be stored; it is lost.
    PersistFailed { job_id: JobId, error: String },
}

#[derive(Debug)]
pub enum Admission {
    /// Protection is off; no job was created.
    Suppressed,
    Accepted { job_id: JobId, outcome: JoinHandle<JobOutcome> },
}

impl Admission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Admission::Suppressed => None,
            Admission::Accepted { job_id, .. } => Some(*job_id),
        }
    }

    /// Wait for the job to finish. `None` when suppressed.
    pub async fn outcome(self) -> Option<JobOutcome> {
        match self {
            Admission::Suppressed => None,
            Admission::Accepted { job_id, outcome } => Some(outcome.await.unwrap_or_else(|e| {
                JobOutcome::PersistFailed { job_id, error: format!("capture task aborted: {e}") }
            })),
        }
    }
}

/// Gate + per-job task runner. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Shared,
    producer: Arc<dyn ArtifactProducer>,
    startup_kinds: Arc<Vec<JobKind>>,
}

impl Dispatcher {
    pub fn new(shared: Shared, producer: Arc<dyn ArtifactProducer>, startup_kinds: Vec<JobKind>) -> Self {
        Self { shared, producer, startup_kinds: Arc::new(startup_kinds) }
    }

    /// Admit a capture if protection is on. Each admitted job runs on its own
    /// task, so a slow capture never holds up the caller or another job.
    pub fn trigger(&self, kind: JobKind, origin: Origin) -> Result<Admission, PersistenceError> {
        if !self.shared.protection.is_enabled() {
            info!(%kind, origin = origin.as_str(), "protection off, capture suppressed");
            return Ok(Admission::Suppressed);
        }
        let job_id = self.shared.store.next_job_id()?;
        let job = Job::new(job_id, kind, origin, now_ms());
        info!(job_id = job_id.get(), %kind, origin = origin.as_str(), "capture admitted");

        let this = self.clone();
        let outcome = tokio::spawn(async move { this.run_job(job).await });
        Ok(Admission::Accepted { job_id, outcome })
    }

    /// One job per configured startup kind, origin `Startup`.
    pub fn fire_startup(&self) -> Result<Vec<Admission>, PersistenceError> {
        self.startup_kinds.iter().map(|kind| self.trigger(*kind, Origin::Startup)).collect()
    }

    async fn run_job(&self, job: Job) -> JobOutcome {
        match self.drive(job).await {
            Ok(outcome) | Err(outcome) => outcome,
        }
    }

    /// `Err` short-circuits with the outcome of a job that cannot go on.
    async fn drive(&self, mut job: Job) -> Result<JobOutcome, JobOutcome> {
        let job_id = job.id;
        if !self.shared.protection.is_enabled() {
            info!(job_id = job_id.get(), "protection switched off before capture, job dropped");
            return Ok(JobOutcome::Dropped(job_id));
        }

        self.advance(&mut job, JobState::Capturing)?;
        let payload = match self.producer.produce(job.kind).await {
            Ok(p) => p,
            Err(error) => {
                self.advance(&mut job, JobState::Failed)?;
                warn!(job_id = job_id.get(), kind = %job.kind, "capture failed: {error}");
                self.shared.diagnostics.record_capture_failure(format!("{} job #{job_id}: {error}", job.kind));
                return Ok(JobOutcome::CaptureFailed { job_id, error });
            }
        };
        self.advance(&mut job, JobState::Captured)?;

        let artifact = Artifact::new(job_id, payload, now_ms())
            .map_err(|e| self.persist_failed(job_id, format!("encode artifact: {e}")))?;
        let entry = self
            .shared
            .store
            .enqueue(&job, &artifact, now_ms())
            .map_err(|e| self.persist_failed(job_id, e.to_string()))?;
        self.advance(&mut job, JobState::Queued)?;
        info!(job_id = job_id.get(), kind = %job.kind, size_bytes = entry.size_bytes, "capture queued");
        self.shared.wake.notify_one();
        Ok(JobOutcome::Queued(job_id))
    }

    fn advance(&self, job: &mut Job, next: JobState) -> Result<(), JobOutcome> {
        job.advance(next).map_err(|e| self.persist_failed(job.id, e.to_string()))
    }

    fn persist_failed(&self, job_id: JobId, error: String) -> JobOutcome {
        tracing::error!(job_id = job_id.get(), "capture lost, could not queue: {error}");
        self.shared.diagnostics.record_error(&error);
        JobOutcome::PersistFailed { job_id, error }
    }
}
