use thiserror::Error;

use crate::{JobKind, JobState};

/// Capture failures are permanent for the job: the cause is the device or its
/// permissions, not the network, so the job is never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no {0} capability configured")]
    Unavailable(JobKind),
    #[error("access denied: {0}")]
    Denied(String),
    #[error("{kind} capture timed out after {after_ms}ms")]
    TimedOut { kind: JobKind, after_ms: u64 },
    #[error("capture failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Network down, timeout, or the remote asked us to back off.
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    /// The remote refused this payload; sending it again will not help.
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("storage backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}
