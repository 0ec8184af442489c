use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use guard_core::{EpochMs, PersistenceError, StatusSnapshot};
use guard_storage::QueueStore;
use tokio::sync::{watch, Notify};

use crate::protection::ProtectionController;

/// Resolves once shutdown was requested or its sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Last observed reachability of the remote channel. `None` until the first
/// probe or delivery attempt.
pub struct LinkState {
    tx: watch::Sender<Option<bool>>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn connected(&self) -> Option<bool> {
        *self.tx.borrow()
    }

    /// Record an observation. Returns true when the link just came back up.
    pub fn observe(&self, up: bool) -> bool {
        let prev = self.tx.send_replace(Some(up));
        up && prev != Some(true)
    }

}

#[derive(Default)]
pub struct Diagnostics {
    last_error: Mutex<Option<String>>,
    capture_failures: AtomicU64,
    last_capture_error: Mutex<Option<String>>,
}

impl Diagnostics {
    pub fn record_error(&self, err: impl ToString) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn record_capture_failure(&self, err: impl ToString) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_capture_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    pub fn capture_failures(&self) -> (u64, Option<String>) {
        let last = self.last_capture_error.lock().unwrap_or_else(|e| e.into_inner()).clone();
        (self.capture_failures.load(Ordering::Relaxed), last)
    }
}

/// Handles shared by every agent task.
#[derive(Clone)]
pub struct Shared {
    pub store: Arc<dyn QueueStore>,
    pub protection: Arc<ProtectionController>,
    pub link: Arc<LinkState>,
    pub diagnostics: Arc<Diagnostics>,
    /// Wakes the delivery worker ahead of its interval.
    pub wake: Arc<Notify>,
}

impl Shared {
    pub fn new(store: Arc<dyn QueueStore>, protection: Arc<ProtectionController>) -> Self {
        Self {
            store,
            protection,
            link: Arc::new(LinkState::new()),
            diagnostics: Arc::new(Diagnostics::default()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Read-only; never creates jobs.
    pub fn snapshot(&self, now: EpochMs) -> Result<StatusSnapshot, PersistenceError> {
        let (capture_failures, last_capture_error) = self.diagnostics.capture_failures();
        Ok(StatusSnapshot {
            taken_at: now,
            protection: self.protection.status(),
            counts: self.store.counts()?,
            connected: self.link.connected(),
            last_error: self.diagnostics.last_error(),
            capture_failures,
            last_capture_error,
        })
    }
}
