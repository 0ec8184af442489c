use guard_core::{Artifact, Job, LocationFix, Origin, Payload, SystemInfoRecord};

pub fn origin_label(origin: Origin) -> &'static str {
    match origin {
        Origin::Startup => "startup",
        Origin::RemoteCommand => "remote request",
        Origin::ManualLocal => "manual",
    }
}

/// One-line caption sent alongside every artifact.
pub fn caption(job: &Job, artifact: &Artifact) -> String {
    format!(
        "{} #{} ({}) captured at {}",
        job.kind,
        job.id,
        origin_label(job.origin),
        artifact.captured_at
    )
}

pub fn location_text(fix: &LocationFix) -> String {
    let unknown = "unknown";
    let mut lines = vec![format!("Location: {:.5}, {:.5}", fix.lat, fix.lon), format!("Source: {}", fix.source)];
    if let Some(acc) = fix.accuracy_m {
        lines.push(format!("Accuracy: ~{acc:.0} m"));
    }
    if fix.ip.is_some() || fix.city.is_some() || fix.country.is_some() {
        lines.push(format!("IP: {}", fix.ip.as_deref().unwrap_or(unknown)));
        lines.push(format!(
            "Place: {}, {}, {}",
            fix.city.as_deref().unwrap_or(unknown),
            fix.region.as_deref().unwrap_or(unknown),
            fix.country.as_deref().unwrap_or(unknown)
        ));
    }
    if let Some(isp) = &fix.isp {
        lines.push(format!("ISP: {isp}"));
    }
    if let Some(tz) = &fix.timezone {
        lines.push(format!("Timezone: {tz}"));
    }
    lines.join("\n")
}

/// Single-line form of `location_text`, for places that take one line only.
pub fn location_summary(fix: &LocationFix) -> String {
    let mut parts: Vec<String> = [&fix.city, &fix.region, &fix.country].into_iter().flatten().cloned().collect();
    match fix.accuracy_m {
        Some(acc) => parts.push(format!("{} ~{acc:.0} m", fix.source)),
        None => parts.push(fix.source.clone()),
    }
    if let Some(ip) = &fix.ip {
        parts.push(format!("IP {ip}"));
    }
    if let Some(isp) = &fix.isp {
        parts.push(isp.clone());
    }
    parts.join(", ")
}

pub fn system_info_text(info: &SystemInfoRecord) -> String {
    let mut lines = vec![
        format!("Host: {}", info.hostname),
        format!("OS: {} ({})", info.os, info.arch),
    ];
    if let Some(user) = &info.user {
        lines.push(format!("User: {user}"));
    }
    if let Some(up) = info.uptime_secs {
        lines.push(format!("Uptime: {}h {}m", up / 3600, (up % 3600) / 60));
    }
    lines.join("\n")
}

/// Text body for artifacts that are not binary media.
pub fn artifact_text(job: &Job, artifact: &Artifact) -> String {
    let body = match &artifact.payload {
        Payload::Photo { bytes, media_type } => format!("{media_type}, {} bytes", bytes.len()),
        Payload::Location(fix) => location_text(fix),
        Payload::SystemInfo(info) => system_info_text(info),
    };
    format!("{}\n{}", caption(job, artifact), body)
}
