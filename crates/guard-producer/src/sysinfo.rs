use async_trait::async_trait;
use guard_core::{now_ms, CaptureError, JobKind, Payload, SystemInfoRecord};

/// Host facts readable without extra privileges.
pub struct SystemInfoProbe;

impl SystemInfoProbe {
    pub fn collect() -> SystemInfoRecord {
        SystemInfoRecord {
            hostname: hostname().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: std::env::var("USER").or_else(|_| std::env::var("USERNAME")).ok(),
            uptime_secs: uptime_secs(),
            collected_at: now_ms(),
        }
    }
}

#[async_trait]
impl crate::ArtifactProducer for SystemInfoProbe {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        if kind != JobKind::SystemInfo {
            return Err(CaptureError::Unavailable(kind));
        }
        Ok(Payload::SystemInfo(Self::collect()))
    }
}

fn hostname() -> Option<String> {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(v) = std::env::var(var) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn uptime_secs() -> Option<u64> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    parse_uptime(&raw)
}

fn parse_uptime(raw: &str) -> Option<u64> {
    let first = raw.split_whitespace().next()?;
    first.parse::<f64>().ok().map(|s| s as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_parses_proc_format() {
        assert_eq!(parse_uptime("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_uptime(""), None);
    }

    #[test]
    fn collect_fills_platform() {
        let r = SystemInfoProbe::collect();
        assert_eq!(r.os, std::env::consts::OS);
        assert!(!r.hostname.is_empty());
    }
}
