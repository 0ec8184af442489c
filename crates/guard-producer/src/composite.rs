use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use guard_core::{CaptureError, JobKind, Payload};

use crate::ArtifactProducer;

/// Routes each kind to its own producer. Kinds without one are `Unavailable`.
#[derive(Default, Clone)]
pub struct CompositeProducer {
    by_kind: HashMap<JobKind, Arc<dyn ArtifactProducer>>,
}

impl CompositeProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: JobKind, producer: Arc<dyn ArtifactProducer>) -> Self {
        self.by_kind.insert(kind, producer);
        self
    }

    pub fn supports(&self, kind: JobKind) -> bool {
        self.by_kind.contains_key(&kind)
    }
}

#[async_trait]
impl ArtifactProducer for CompositeProducer {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        match self.by_kind.get(&kind) {
            Some(p) => {
                let payload = p.produce(kind).await?;
                if payload.kind() != kind {
                    return Err(CaptureError::Failed(format!(
                        "{kind} producer returned a {} payload",
                        payload.kind()
                    )));
                }
                Ok(payload)
            }
            None => Err(CaptureError::Unavailable(kind)),
        }
    }
}
