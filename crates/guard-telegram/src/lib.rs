//! Telegram Bot API implementation of `RemoteChannel`.

mod api;
mod channel;

pub use api::{classify_status, parse_updates};
pub use channel::*;
