use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use guard_channel::{artifact_text, caption, location_summary, InboundMessage, RemoteChannel};
use guard_core::{Artifact, Job, Payload, TransportError};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::api::{collect_updates, decode_response, Update};

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub api_base: String,
    pub send_timeout: Duration,
    /// Long-poll wait for `getUpdates`; 0 returns immediately.
    pub poll_timeout_secs: u64,
}

pub struct TelegramChannel {
    client: Client,
    cfg: TelegramConfig,
    /// Next `getUpdates` offset, 0 until the first batch is seen.
    offset: AtomicI64,
}

impl TelegramChannel {
    pub fn new(cfg: TelegramConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(net_err)?;
        Ok(Self { client, cfg, offset: AtomicI64::new(0) })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.cfg.api_base.trim_end_matches('/'), self.cfg.bot_token)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, req: RequestBuilder) -> Result<T, TransportError> {
        let resp = req.send().await.map_err(net_err)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(net_err)?;
        debug!("telegram {method} -> HTTP {status}");
        decode_response(status, &body)
    }

    async fn send_json(&self, method: &str, body: serde_json::Value) -> Result<(), TransportError> {
        let req = self.client.post(self.url(method)).timeout(self.cfg.send_timeout).json(&body);
        self.call::<serde_json::Value>(method, req).await.map(|_| ())
    }

    async fn send_photo(&self, caption: String, media_type: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let ext = if media_type == "image/png" { "png" } else { "jpg" };
        let part = Part::bytes(bytes)
            .file_name(format!("capture.{ext}"))
            .mime_str(media_type)
            .map_err(|e| TransportError::Rejected(format!("media type {media_type}: {e}")))?;
        let form = Form::new()
            .text("chat_id", self.cfg.chat_id.to_string())
            .text("caption", caption)
            .part("photo", part);
        let req = self.client.post(self.url("sendPhoto")).timeout(self.cfg.send_timeout).multipart(form);
        self.call::<serde_json::Value>("sendPhoto", req).await.map(|_| ())
    }
}

/// One artifact maps to exactly one Bot API request, so a retry after a
/// failed send never repeats a message the recipient already got.
#[derive(Debug, PartialEq)]
enum Outbound {
    Json { method: &'static str, body: serde_json::Value },
    Photo { caption: String, media_type: String, bytes: Vec<u8> },
}

fn outbound(chat_id: i64, job: &Job, artifact: &Artifact) -> Outbound {
    match &artifact.payload {
        Payload::Photo { media_type, bytes } => Outbound::Photo {
            caption: caption(job, artifact),
            media_type: media_type.clone(),
            bytes: bytes.clone(),
        },
        // a venue carries the pin and the summary together
        Payload::Location(fix) => Outbound::Json {
            method: "sendVenue",
            body: json!({
                "chat_id": chat_id,
                "latitude": fix.lat,
                "longitude": fix.lon,
                "title": caption(job, artifact),
                "address": location_summary(fix),
            }),
        },
        Payload::SystemInfo(_) => Outbound::Json {
            method: "sendMessage",
            body: json!({ "chat_id": chat_id, "text": artifact_text(job, artifact) }),
        },
    }
}

/// Network-level failures are always retryable. The URL is stripped because
/// it carries the bot token.
fn net_err(e: reqwest::Error) -> TransportError {
    TransportError::Unreachable(e.without_url().to_string())
}

#[async_trait]
impl RemoteChannel for TelegramChannel {
    async fn send_artifact(&self, job: &Job, artifact: &Artifact) -> Result<(), TransportError> {
        match outbound(self.cfg.chat_id, job, artifact) {
            Outbound::Json { method, body } => self.send_json(method, body).await,
            Outbound::Photo { caption, media_type, bytes } => self.send_photo(caption, &media_type, bytes).await,
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_json("sendMessage", json!({ "chat_id": self.cfg.chat_id, "text": text })).await
    }

    async fn poll_inbound(&self) -> Result<Vec<InboundMessage>, TransportError> {
        let offset = self.offset.load(Ordering::SeqCst);
        let wait = self.cfg.poll_timeout_secs;
        let req = self
            .client
            .get(self.url("getUpdates"))
            .query(&[("offset", offset.to_string()), ("timeout", wait.to_string())])
            .timeout(Duration::from_secs(wait + 10));
        let updates: Vec<Update> = self.call("getUpdates", req).await?;
        let (messages, next) = collect_updates(updates);
        if let Some(next) = next {
            self.offset.fetch_max(next, Ordering::SeqCst);
        }
        Ok(messages)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let req = self.client.get(self.url("getMe")).timeout(Duration::from_secs(10));
        self.call::<serde_json::Value>("getMe", req).await.map(|_| ())
    }
}
