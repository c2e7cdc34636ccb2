use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Grab one JPEG frame from an RTSP stream with ffmpeg.
///
/// TCP transport, a single frame, written to stdout as MJPEG. The child is
/// killed if it has not finished within `timeout`.
pub async fn capture_rtsp_jpeg(rtsp_url: &str, timeout: Duration) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner", "-loglevel", "error",
        "-rtsp_transport", "tcp",
        "-i", rtsp_url,
        "-frames:v", "1",
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-q:v", "2",
        "-y",
        "pipe:1",
    ]);
    cmd.kill_on_drop(true);

    debug!(rtsp_url, "capture: ffmpeg rtsp");
    let out = tokio::time::timeout(timeout, cmd.output())
        .await
        .with_context(|| format!("frame capture timed out after {:?}", timeout))?
        .context("run ffmpeg capture (is ffmpeg installed?)")?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let head: String = stderr.chars().take(200).collect();
        anyhow::bail!("ffmpeg failed: {}", head.trim());
    }
    anyhow::ensure!(!out.stdout.is_empty(), "ffmpeg returned empty frame");
    Ok(out.stdout)
}
