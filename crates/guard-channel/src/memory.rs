use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use guard_core::{Artifact, Job, JobId, JobKind, Origin, TransportError};

use crate::{caption, InboundMessage, RemoteChannel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentArtifact {
    pub job_id: JobId,
    pub kind: JobKind,
    pub origin: Origin,
    pub caption: String,
}

/// In-memory channel for tests. Records everything sent and lets the test
/// flip reachability or reject specific kinds.
#[derive(Default)]
pub struct MemoryChannel {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    unreachable: bool,
    unreachable_after: Option<usize>,
    rejected_kinds: HashSet<JobKind>,
    artifacts: Vec<SentArtifact>,
    texts: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    send_calls: usize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.unreachable = !reachable;
        inner.unreachable_after = None;
    }

    /// Accept `n` more artifact sends, then behave as unreachable.
    pub fn unreachable_after(&self, n: usize) {
        self.inner.lock().unwrap().unreachable_after = Some(n);
    }

    pub fn reject_kind(&self, kind: JobKind) {
        self.inner.lock().unwrap().rejected_kinds.insert(kind);
    }

    pub fn push_inbound(&self, sender: &str, text: &str) {
        self.inner
            .lock()
            .unwrap()
            .inbound
            .push_back(InboundMessage { sender: sender.to_string(), text: text.to_string() });
    }

    pub fn sent_artifacts(&self) -> Vec<SentArtifact> {
        self.inner.lock().unwrap().artifacts.clone()
    }

    pub fn delivered_ids(&self) -> Vec<JobId> {
        self.inner.lock().unwrap().artifacts.iter().map(|a| a.job_id).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.inner.lock().unwrap().texts.clone()
    }

    /// Artifact send attempts, successful or not.
    pub fn send_calls(&self) -> usize {
        self.inner.lock().unwrap().send_calls
    }
}

impl Inner {
    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.unreachable || self.unreachable_after == Some(0) {
            return Err(TransportError::Unreachable("memory channel offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn send_artifact(&self, job: &Job, artifact: &Artifact) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.send_calls += 1;
        inner.check_reachable()?;
        if inner.rejected_kinds.contains(&job.kind) {
            return Err(TransportError::Rejected(format!("{} not accepted", job.kind)));
        }
        if let Some(n) = inner.unreachable_after.as_mut() {
            *n -= 1;
        }
        inner.artifacts.push(SentArtifact {
            job_id: job.id,
            kind: job.kind,
            origin: job.origin,
            caption: caption(job, artifact),
        });
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_reachable()?;
        inner.texts.push(text.to_string());
        Ok(())
    }

    async fn poll_inbound(&self) -> Result<Vec<InboundMessage>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_reachable()?;
        Ok(inner.inbound.drain(..).collect())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().check_reachable()
    }
}
