use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Photo,
    Location,
    SystemInfo,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Photo => "photo",
            JobKind::Location => "location",
            JobKind::SystemInfo => "system_info",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "photo" | "camera" | "webcam" => Ok(JobKind::Photo),
            "location" | "loc" => Ok(JobKind::Location),
            "system_info" | "sysinfo" | "system-info" => Ok(JobKind::SystemInfo),
            other => Err(format!("unknown job kind '{other}' (expected photo, location or system_info)")),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Startup,
    RemoteCommand,
    ManualLocal,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Startup => "startup",
            Origin::RemoteCommand => "remote_command",
            Origin::ManualLocal => "manual_local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "startup" => Some(Origin::Startup),
            "remote_command" => Some(Origin::RemoteCommand),
            "manual_local" => Some(Origin::ManualLocal),
            _ => None,
        }
    }
}

/// Lifecycle of a single job.
///
/// `Requested -> Capturing -> Captured -> Queued -> Delivered | Failed`, with
/// `Capturing -> Failed` when the producer reports a capture error.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Requested,
    Capturing,
    Captured,
    Queued,
    Delivered,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Delivered | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Requested, Capturing)
                | (Capturing, Captured)
                | (Capturing, Failed)
                | (Captured, Queued)
                | (Queued, Delivered)
                | (Queued, Failed)
        )
    }
}

/// Persisted status of a queue entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
            EntryStatus::Delivered => "delivered",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "in_flight" => Some(EntryStatus::InFlight),
            "delivered" => Some(EntryStatus::Delivered),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Delivered | EntryStatus::Failed)
    }

    /// Job state implied by the entry status once the job sits in the queue.
    pub fn job_state(&self) -> JobState {
        match self {
            EntryStatus::Pending | EntryStatus::InFlight => JobState::Queued,
            EntryStatus::Delivered => JobState::Delivered,
            EntryStatus::Failed => JobState::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        let all = [
            JobState::Requested,
            JobState::Capturing,
            JobState::Captured,
            JobState::Queued,
            JobState::Delivered,
            JobState::Failed,
        ];
        for terminal in [JobState::Delivered, JobState::Failed] {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn capture_failure_skips_queue() {
        assert!(JobState::Capturing.can_transition_to(JobState::Failed));
        assert!(!JobState::Requested.can_transition_to(JobState::Queued));
        assert!(!JobState::Captured.can_transition_to(JobState::Delivered));
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("Photo".parse::<JobKind>().unwrap(), JobKind::Photo);
        assert_eq!("sysinfo".parse::<JobKind>().unwrap(), JobKind::SystemInfo);
        assert!("video".parse::<JobKind>().is_err());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [EntryStatus::Pending, EntryStatus::InFlight, EntryStatus::Delivered, EntryStatus::Failed] {
            assert_eq!(EntryStatus::parse(s.as_str()), Some(s));
        }
    }
}
