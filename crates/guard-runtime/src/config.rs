use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use guard_core::{BackoffPolicy, JobKind};
use guard_producer::{
    ArtifactProducer, CaptureTimeouts, CommandCapture, CompositeProducer, IpLocator, LocationProducer, SystemInfoProbe,
    TimedProducer, DEFAULT_LOCATION_ENDPOINT,
};

use crate::worker::WorkerConfig;

pub const PLACEHOLDER_TOKEN: &str = "YOUR_TOKEN_HERE";
pub const DEFAULT_DATA_DIR: &str = "~/.teleguard";
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub recipient: RecipientConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub startup: StartupConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecipientConfig {
    pub bot_token: String,
    pub chat_id: i64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Long-poll wait for inbound commands.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_queue_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { max_queue_bytes: 256 * 1024 * 1024 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Retries after an unreachable send. An entry that still fails is marked
    /// Failed and shows `max_attempts + 1` attempts.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_factor: u32,
    pub backoff_cap_secs: u64,
    pub send_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub probe_interval_secs: u64,
    /// Pause between inbound polls.
    pub poll_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            interval_secs: 30,
            batch_size: 16,
            max_attempts: 4,
            backoff_base_secs: backoff.base_secs,
            backoff_factor: backoff.factor,
            backoff_cap_secs: backoff.cap_secs,
            send_timeout_secs: 60,
            lease_ttl_secs: 120,
            probe_interval_secs: 60,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub photo_timeout_secs: u64,
    pub location_timeout_secs: u64,
    pub system_info_timeout_secs: u64,
    /// argv of a command writing one JPEG/PNG frame to stdout. Empty disables photos.
    pub photo_command: Vec<String>,
    /// argv of a positioning command printing `lat,lon[,accuracy_m[,source]]`.
    /// Tried before the IP lookup; empty skips it.
    pub location_command: Vec<String>,
    /// Share of `location_timeout_secs` the positioning command may use.
    pub location_command_timeout_secs: u64,
    pub location_endpoint: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let t = CaptureTimeouts::default();
        Self {
            photo_timeout_secs: t.photo.as_secs(),
            location_timeout_secs: t.location.as_secs(),
            system_info_timeout_secs: t.system_info.as_secs(),
            photo_command: vec![],
            location_command: vec![],
            location_command_timeout_secs: 5,
            location_endpoint: DEFAULT_LOCATION_ENDPOINT.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub kinds: Vec<JobKind>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { kinds: vec![JobKind::SystemInfo, JobKind::Photo, JobKind::Location] }
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_poll_timeout() -> u64 {
    25
}

impl Config {
    /// Template written by `teleguard init`; refuses to run until edited.
    pub fn default_template() -> Self {
        Self {
            recipient: RecipientConfig {
                bot_token: PLACEHOLDER_TOKEN.to_string(),
                chat_id: 0,
                api_base: default_api_base(),
                poll_timeout_secs: default_poll_timeout(),
            },
            storage: StorageConfig::default(),
            delivery: DeliveryConfig::default(),
            capture: CaptureConfig {
                photo_command: vec![
                    "fswebcam".to_string(),
                    "--no-banner".to_string(),
                    "-q".to_string(),
                    "-".to_string(),
                ],
                ..CaptureConfig::default()
            },
            startup: StartupConfig::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let token = self.recipient.bot_token.trim();
        if token.is_empty() || token == PLACEHOLDER_TOKEN {
            bail!("recipient.bot_token is not configured");
        }
        if self.recipient.chat_id == 0 {
            bail!("recipient.chat_id is not configured");
        }
        let d = &self.delivery;
        if d.batch_size == 0 {
            bail!("delivery.batch_size must be at least 1");
        }
        if d.interval_secs == 0 || d.probe_interval_secs == 0 {
            bail!("delivery intervals must be at least 1s");
        }
        if d.backoff_factor == 0 || d.backoff_base_secs == 0 {
            bail!("delivery backoff base and factor must be at least 1");
        }
        if d.lease_ttl_secs <= d.interval_secs {
            bail!("delivery.lease_ttl_secs must exceed delivery.interval_secs");
        }
        let c = &self.capture;
        if !c.location_command.is_empty() && c.location_command_timeout_secs >= c.location_timeout_secs {
            bail!("capture.location_command_timeout_secs must be below capture.location_timeout_secs");
        }
        Ok(())
    }

    pub fn recipient_id(&self) -> String {
        self.recipient.chat_id.to_string()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_secs: self.delivery.backoff_base_secs,
            factor: self.delivery.backoff_factor,
            cap_secs: self.delivery.backoff_cap_secs,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            interval: Duration::from_secs(self.delivery.interval_secs),
            batch_size: self.delivery.batch_size,
            max_attempts: self.delivery.max_attempts,
            backoff: self.backoff(),
            send_timeout: Duration::from_secs(self.delivery.send_timeout_secs),
            lease_ttl: Duration::from_secs(self.delivery.lease_ttl_secs),
        }
    }

    pub fn capture_timeouts(&self) -> CaptureTimeouts {
        CaptureTimeouts {
            photo: Duration::from_secs(self.capture.photo_timeout_secs),
            location: Duration::from_secs(self.capture.location_timeout_secs),
            system_info: Duration::from_secs(self.capture.system_info_timeout_secs),
        }
    }

    /// System info is always available; photo needs a command, location a
    /// positioning command or an IP lookup endpoint.
    pub fn build_producer(&self) -> Result<Arc<dyn ArtifactProducer>> {
        let c = &self.capture;
        let mut composite = CompositeProducer::new().with(JobKind::SystemInfo, Arc::new(SystemInfoProbe));
        if !c.photo_command.is_empty() {
            composite = composite.with(JobKind::Photo, Arc::new(CommandCapture::new(c.photo_command.clone())));
        }

        let command_timeout = c.location_command_timeout_secs.min(c.location_timeout_secs);
        let ip = if c.location_endpoint.trim().is_empty() {
            None
        } else {
            let remaining = if c.location_command.is_empty() {
                c.location_timeout_secs
            } else {
                c.location_timeout_secs.saturating_sub(command_timeout)
            };
            let locator = IpLocator::new(c.location_endpoint.clone(), Duration::from_secs(remaining.max(1)))
                .context("build location client")?;
            Some(locator)
        };
        if ip.is_some() || !c.location_command.is_empty() {
            let locator = LocationProducer::new(ip)
                .with_command(c.location_command.clone(), Duration::from_secs(command_timeout));
            composite = composite.with(JobKind::Location, Arc::new(locator));
        }
        Ok(Arc::new(TimedProducer::new(composite, self.capture_timeouts())))
    }

    /// `--data-dir` wins, then `TELEGUARD_HOME`, then `~/.teleguard`.
    pub fn data_dir(arg: Option<&str>) -> PathBuf {
        let raw = arg
            .map(str::to_string)
            .or_else(|| std::env::var("TELEGUARD_HOME").ok())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        PathBuf::from(shellexpand::tilde(&raw).to_string())
    }

    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("teleguard.toml")
    }

    pub fn db_path(data_dir: &Path) -> PathBuf {
        data_dir.join("teleguard.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn configured() -> Config {
        let mut cfg = Config::default_template();
        cfg.recipient.bot_token = "123456:real-token".into();
        cfg.recipient.chat_id = 987654;
        cfg
    }

    #[test]
    fn template_is_rejected_until_edited() {
        let err = Config::default_template().validate().unwrap_err();
        assert!(err.to_string().contains("bot_token"));

        let mut cfg = configured();
        cfg.recipient.chat_id = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("chat_id"));

        configured().validate().unwrap();
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = Config::config_path(dir.path());
        configured().save_to(&path).unwrap();
        let back = Config::load_from(&path).unwrap();
        assert_eq!(back.recipient.chat_id, 987654);
        assert_eq!(back.startup.kinds, vec![JobKind::SystemInfo, JobKind::Photo, JobKind::Location]);
        assert_eq!(back.capture.photo_command[0], "fswebcam");
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [recipient]
            bot_token = "1:x"
            chat_id = 5

            [delivery]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.delivery.max_attempts, 2);
        assert_eq!(cfg.delivery.batch_size, 16);
        assert_eq!(cfg.backoff(), BackoffPolicy::default());
        assert_eq!(cfg.recipient.api_base, DEFAULT_API_BASE);
        assert!(cfg.capture.photo_command.is_empty());
        assert_eq!(cfg.worker_config().interval, Duration::from_secs(30));
    }

    #[test]
    fn lease_must_outlive_interval() {
        let mut cfg = configured();
        cfg.delivery.lease_ttl_secs = cfg.delivery.interval_secs;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn location_command_must_leave_time_for_ip_lookup() {
        let mut cfg = configured();
        cfg.capture.location_command = vec!["gps-fix".into()];
        cfg.validate().unwrap();
        cfg.capture.location_command_timeout_secs = cfg.capture.location_timeout_secs;
        assert!(cfg.validate().unwrap_err().to_string().contains("location_command_timeout_secs"));
    }

    #[test]
    fn data_dir_expands_tilde() {
        let dir = Config::data_dir(Some("~/guard-data"));
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert_eq!(Config::data_dir(Some("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
