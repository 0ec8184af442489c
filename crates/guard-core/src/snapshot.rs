use serde::{Deserialize, Serialize};

use crate::{EpochMs, ProtectionState, QueueCounts};

/// Read-only view answered to `StatusQuery` and printed by the CLI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub taken_at: EpochMs,
    pub protection: ProtectionState,
    pub counts: QueueCounts,
    /// Last connectivity observation; `None` until the first probe.
    pub connected: Option<bool>,
    /// Last persistence error seen by a background task.
    pub last_error: Option<String>,
    /// Captures that failed since the agent started. They are never queued.
    pub capture_failures: u64,
    pub last_capture_error: Option<String>,
}

impl StatusSnapshot {
    pub fn render(&self) -> String {
        let mut s = String::new();
        s.push_str("TeleGuard status\n");
        s.push_str(&format!(
            "Protection: {}\n",
            if self.protection.enabled { "ON" } else { "OFF" }
        ));
        let link = match self.connected {
            Some(true) => "connected",
            Some(false) => "unreachable",
            None => "unknown",
        };
        s.push_str(&format!("Remote link: {link}\n"));
        s.push_str(&format!(
            "Queue: {} pending, {} in flight, {} delivered, {} failed\n",
            self.counts.pending, self.counts.in_flight, self.counts.delivered, self.counts.failed
        ));
        s.push_str(&format!("Stored payload bytes: {}", self.counts.held_bytes));
        if self.capture_failures > 0 {
            s.push_str(&format!("\nCapture failures: {}", self.capture_failures));
            if let Some(err) = &self.last_capture_error {
                s.push_str(&format!(" (last: {err})"));
            }
        }
        if let Some(err) = &self.last_error {
            s.push_str(&format!("\nLast storage error: {err}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_mentions_every_count() {
        let snap = StatusSnapshot {
            taken_at: 0,
            protection: ProtectionState { enabled: true, last_changed_at: 0 },
            counts: QueueCounts { pending: 3, in_flight: 1, delivered: 7, failed: 2, held_bytes: 1024 },
            connected: Some(false),
            last_error: None,
            capture_failures: 0,
            last_capture_error: None,
        };
        let text = snap.render();
        assert!(text.contains("Protection: ON"));
        assert!(text.contains("3 pending, 1 in flight, 7 delivered, 2 failed"));
        assert!(text.contains("unreachable"));
        assert!(!text.contains("Last storage error"));
        assert!(!text.contains("Capture failures"));
    }

    #[test]
    fn render_reports_capture_failures() {
        let snap = StatusSnapshot {
            taken_at: 0,
            protection: ProtectionState::default(),
            counts: QueueCounts::default(),
            connected: None,
            last_error: None,
            capture_failures: 2,
            last_capture_error: Some("photo job #4: no photo capability configured".into()),
        };
        assert!(snap.render().contains("Capture failures: 2 (last: photo job #4: no photo capability configured)"));
    }
}
