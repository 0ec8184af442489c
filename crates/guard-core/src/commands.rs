use crate::model::JobKind;

/// Closed vocabulary understood from the remote recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Capture(JobKind),
    StatusQuery,
    FlushPending,
    Help,
    Unknown(String),
}

pub const HELP_TEXT: &str = "TeleGuard commands:\n\
/photo - take a webcam snapshot\n\
/location - send the current location fix\n\
/sysinfo - send a system info snapshot\n\
/status - protection state and queue counts\n\
/flush - deliver pending captures now\n\
/help - show this help";

/// Parse free text into a command. Only the first word counts; a leading `/`
/// and a `@botname` suffix are optional.
pub fn parse_command(text: &str) -> RemoteCommand {
    let Some(first) = text.split_whitespace().next() else {
        return RemoteCommand::Unknown(String::new());
    };
    let word = first.trim_start_matches('/');
    let word = word.split('@').next().unwrap_or(word).to_ascii_lowercase();

    match word.as_str() {
        "photo" | "capture" | "snap" => RemoteCommand::Capture(JobKind::Photo),
        "location" | "where" => RemoteCommand::Capture(JobKind::Location),
        "sysinfo" | "system" | "info" => RemoteCommand::Capture(JobKind::SystemInfo),
        "status" => RemoteCommand::StatusQuery,
        "flush" | "pending" | "sync" => RemoteCommand::FlushPending,
        "help" | "start" | "menu" => RemoteCommand::Help,
        _ => RemoteCommand::Unknown(text.trim().to_string()),
    }
}
