use std::time::Duration;

use async_trait::async_trait;
use guard_core::{CaptureError, JobKind, Payload};

/// Turns a capture request into a payload. Implementations must be safe to
/// call concurrently; one call per job.
#[async_trait]
pub trait ArtifactProducer: Send + Sync {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureTimeouts {
    pub photo: Duration,
    pub location: Duration,
    pub system_info: Duration,
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        Self {
            photo: Duration::from_secs(10),
            location: Duration::from_secs(15),
            system_info: Duration::from_secs(2),
        }
    }
}

impl CaptureTimeouts {
    pub fn for_kind(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Photo => self.photo,
            JobKind::Location => self.location,
            JobKind::SystemInfo => self.system_info,
        }
    }
}

/// Bounds every capture by its per-kind timeout. The inner future is dropped
/// on expiry, which also kills any child process it spawned.
pub struct TimedProducer<P> {
    inner: P,
    timeouts: CaptureTimeouts,
}

impl<P: ArtifactProducer> TimedProducer<P> {
    pub fn new(inner: P, timeouts: CaptureTimeouts) -> Self {
        Self { inner, timeouts }
    }
}

#[async_trait]
impl<P: ArtifactProducer> ArtifactProducer for TimedProducer<P> {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        let limit = self.timeouts.for_kind(kind);
        match tokio::time::timeout(limit, self.inner.produce(kind)).await {
            Ok(res) => res,
            Err(_) => Err(CaptureError::TimedOut { kind, after_ms: limit.as_millis() as u64 }),
        }
    }
}
