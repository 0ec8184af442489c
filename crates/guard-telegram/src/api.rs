use guard_channel::InboundMessage;
use guard_core::TransportError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Only a refusal of the payload itself is `Rejected`. Throttling, server
/// errors and problems with the bot or chat (bad token, blocked bot, wrong
/// endpoint) hit every entry alike, so they stop the cycle and are retried.
pub fn classify_status(status: u16, description: &str) -> TransportError {
    let msg = format!("HTTP {status}: {description}");
    match status {
        401 | 403 | 404 | 429 => TransportError::Unreachable(msg),
        400..=499 => TransportError::Rejected(msg),
        _ => TransportError::Unreachable(msg),
    }
}

pub(crate) fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, TransportError> {
    let env: ApiEnvelope<T> = match serde_json::from_str(body) {
        Ok(env) => env,
        Err(e) => return Err(classify_status(status, &format!("unreadable response: {e}"))),
    };
    if env.ok && (200..300).contains(&status) {
        return env
            .result
            .ok_or_else(|| TransportError::Unreachable("response without result".to_string()));
    }
    let mut description = env.description.unwrap_or_else(|| "request failed".to_string());
    if let Some(secs) = env.parameters.and_then(|p| p.retry_after) {
        description.push_str(&format!(" (retry after {secs}s)"));
    }
    let code = env.error_code.unwrap_or(status);
    Err(classify_status(if (200..300).contains(&code) { 500 } else { code }, &description))
}

/// Text messages from a `getUpdates` result plus the offset that acknowledges
/// all of them. Non-text updates are skipped but still acknowledged.
pub fn parse_updates(body: &str) -> Result<(Vec<InboundMessage>, Option<i64>), TransportError> {
    let updates: Vec<Update> = decode_response(200, body)?;
    Ok(collect_updates(updates))
}

pub(crate) fn collect_updates(updates: Vec<Update>) -> (Vec<InboundMessage>, Option<i64>) {
    let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
    let messages = updates
        .into_iter()
        .filter_map(|u| u.message)
        .filter_map(|m| m.text.map(|text| InboundMessage { sender: m.chat.id.to_string(), text }))
        .collect();
    (messages, next_offset)
}
