use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use guard_core::{CaptureError, JobKind, Payload};
use tracing::debug;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Runs an external camera command and takes its stdout as the image, e.g.
/// `["fswebcam", "--no-banner", "-"]` or `["ffmpeg", ..., "-f", "mjpeg", "-"]`.
pub struct CommandCapture {
    argv: Vec<String>,
}

impl CommandCapture {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

/// Run a capture command and return its stdout. A missing binary means the
/// device has no such capability.
pub(crate) async fn run_capture_command(argv: &[String], kind: JobKind) -> Result<Vec<u8>, CaptureError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(CaptureError::Unavailable(kind));
    };

    let mut command = tokio::process::Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let child = command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => CaptureError::Unavailable(kind),
        ErrorKind::PermissionDenied => CaptureError::Denied(format!("{program}: {e}")),
        _ => CaptureError::Failed(format!("spawn {program}: {e}")),
    })?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CaptureError::Failed(format!("wait for {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CaptureError::Failed(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if output.stdout.is_empty() {
        return Err(CaptureError::Failed(format!("{program} produced no output")));
    }
    debug!("{program} captured {} bytes", output.stdout.len());
    Ok(output.stdout)
}

pub fn sniff_image_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(PNG_MAGIC) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

#[async_trait]
impl crate::ArtifactProducer for CommandCapture {
    async fn produce(&self, kind: JobKind) -> Result<Payload, CaptureError> {
        if kind != JobKind::Photo {
            return Err(CaptureError::Unavailable(kind));
        }
        let bytes = run_capture_command(&self.argv, JobKind::Photo).await?;
        Ok(Payload::Photo { media_type: sniff_image_type(&bytes).to_string(), bytes })
    }
}
