use std::sync::{Arc, Mutex};

use guard_core::{EpochMs, PersistenceError, ProtectionState};
use guard_storage::ProtectionStore;
use tokio::sync::watch;
use tracing::info;

/// Owner of the protection flag. Every change is persisted before it is
/// published to subscribers.
pub struct ProtectionController {
    store: Arc<dyn ProtectionStore>,
    tx: watch::Sender<ProtectionState>,
    write: Mutex<()>,
}

impl ProtectionController {
    /// Loads the persisted state once; an absent row means disabled.
    pub fn load(store: Arc<dyn ProtectionStore>) -> Result<Self, PersistenceError> {
        let state = store.load_protection()?.unwrap_or_default();
        let (tx, _rx) = watch::channel(state);
        Ok(Self { store, tx, write: Mutex::new(()) })
    }

    pub fn status(&self) -> ProtectionState {
        *self.tx.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.borrow().enabled
    }

    pub fn subscribe(&self) -> watch::Receiver<ProtectionState> {
        self.tx.subscribe()
    }

    pub fn enable(&self, now: EpochMs) -> Result<ProtectionState, PersistenceError> {
        self.set(true, now)
    }

    pub fn disable(&self, now: EpochMs) -> Result<ProtectionState, PersistenceError> {
        self.set(false, now)
    }

    fn set(&self, enabled: bool, now: EpochMs) -> Result<ProtectionState, PersistenceError> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.status();
        if current.enabled == enabled {
            return Ok(current);
        }
        let next = ProtectionState { enabled, last_changed_at: now };
        self.store.save_protection(&next)?;
        self.tx.send_replace(next);
        info!(enabled, "protection {}", if enabled { "enabled" } else { "disabled" });
        Ok(next)
    }

    /// Pick up a change written by another process (the CLI). Returns true
    /// when the state changed.
    pub fn refresh(&self) -> Result<bool, PersistenceError> {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let stored = self.store.load_protection()?.unwrap_or_default();
        if stored == self.status() {
            return Ok(false);
        }
        self.tx.send_replace(stored);
        info!(enabled = stored.enabled, "protection changed externally");
        Ok(true)
    }
}
