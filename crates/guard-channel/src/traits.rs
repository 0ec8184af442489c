use async_trait::async_trait;
use guard_core::{Artifact, Job, TransportError};

/// A message received from the remote side. `sender` is the channel's
/// identity for whoever wrote it (a chat id for Telegram).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
}

/// Outbound link to the single remote recipient plus its inbound command feed.
///
/// Errors must be classified: `Unreachable` for anything a later retry may
/// fix, `Rejected` when the remote refused this particular payload.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn send_artifact(&self, job: &Job, artifact: &Artifact) -> Result<(), TransportError>;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Messages received since the previous call, oldest first.
    async fn poll_inbound(&self) -> Result<Vec<InboundMessage>, TransportError>;

    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), TransportError>;
}
