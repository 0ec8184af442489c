use std::sync::Arc;
use std::time::Duration;

use guard_channel::{InboundMessage, RemoteChannel};
use guard_core::{now_ms, parse_command, Origin, RemoteCommand, TransportError, HELP_TEXT};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::{Admission, Dispatcher, JobOutcome};
use crate::state::{shutdown_requested, Shared};

/// Single task fielding inbound messages strictly in arrival order.
pub struct Router {
    shared: Shared,
    dispatcher: Dispatcher,
    channel: Arc<dyn RemoteChannel>,
    recipient: String,
    poll_interval: Duration,
}

impl Router {
    pub fn new(
        shared: Shared,
        dispatcher: Dispatcher,
        channel: Arc<dyn RemoteChannel>,
        recipient: String,
        poll_interval: Duration,
    ) -> Self {
        Self { shared, dispatcher, channel, recipient, poll_interval }
    }

    /// Reply to one message. `None` when the sender is not the recipient.
    pub async fn handle(&self, msg: &InboundMessage) -> Option<String> {
        if msg.sender != self.recipient {
            warn!(sender = %msg.sender, "ignoring message from unknown sender");
            return None;
        }
        let command = parse_command(&msg.text);
        debug!(?command, "inbound command");
        let (reply, accepted) = self.reply_to(command);
        if let Err(e) = self.channel.send_text(&reply).await {
            warn!("reply failed: {e}");
        }
        if let Some(admission) = accepted {
            self.report_failure(admission);
        }
        Some(reply)
    }

    /// The reply text, plus the admitted job when the command started a capture.
    fn reply_to(&self, command: RemoteCommand) -> (String, Option<Admission>) {
        let reply = match command {
            RemoteCommand::Capture(kind) => match self.dispatcher.trigger(kind, Origin::RemoteCommand) {
                Ok(Admission::Suppressed) => "Protection is OFF, capture ignored.".to_string(),
                Ok(admission @ Admission::Accepted { job_id, .. }) => {
                    return (format!("Capturing {kind} (job #{job_id}), it will follow shortly."), Some(admission));
                }
                Err(e) => {
                    self.shared.diagnostics.record_error(&e);
                    format!("Could not start capture: {e}")
                }
            },
            RemoteCommand::StatusQuery => match self.shared.snapshot(now_ms()) {
                Ok(snapshot) => snapshot.render(),
                Err(e) => format!("Status unavailable: {e}"),
            },
            RemoteCommand::FlushPending => {
                self.shared.wake.notify_one();
                match self.shared.store.counts() {
                    Ok(counts) => format!("Flushing {} pending capture(s).", counts.pending),
                    Err(e) => format!("Flush requested, queue unreadable: {e}"),
                }
            }
            RemoteCommand::Help => HELP_TEXT.to_string(),
            RemoteCommand::Unknown(text) => format!("Unknown command: {text}\n\n{HELP_TEXT}"),
        };
        (reply, None)
    }

    /// Tell the recipient when an accepted capture never makes it to the queue.
    /// Runs on its own task so a slow capture never holds up the next command.
    fn report_failure(&self, admission: Admission) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let text = match admission.outcome().await {
                Some(JobOutcome::CaptureFailed { job_id, error }) => format!("Job #{job_id} failed: {error}"),
                Some(JobOutcome::PersistFailed { job_id, error }) => {
                    format!("Job #{job_id} was captured but could not be stored: {error}")
                }
                Some(JobOutcome::Dropped(job_id)) => format!("Job #{job_id} dropped, protection was turned off."),
                Some(JobOutcome::Queued(_)) | None => return,
            };
            if let Err(e) = channel.send_text(&text).await {
                warn!("failure notice not sent: {e}");
            }
        });
    }

    /// Fetch and handle one batch of inbound messages.
    pub async fn poll_once(&self) -> Result<usize, TransportError> {
        let messages = self.channel.poll_inbound().await?;
        for msg in &messages {
            self.handle(msg).await;
        }
        Ok(messages.len())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("command router started");
        loop {
            let polled = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                res = self.poll_once() => res,
            };
            if let Err(e) = polled {
                debug!("inbound poll failed: {e}");
                self.shared.link.observe(false);
            }
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("command router stopped");
    }
}
