use std::{future::Future, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{SendOutcome, Uplink};

/// One camera the edge box polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSource {
    pub camera_id: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self, rtsp_url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// Captures through a local ffmpeg binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSource;

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn capture(&self, rtsp_url: &str, timeout: Duration) -> Result<Vec<u8>> {
        qc_vision::camera::capture_rtsp_jpeg(rtsp_url, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Target time between the starts of two cycles.
    pub interval: Duration,
    pub max_retries: u32,
    pub capture_timeout: Duration,
    /// First retry delay; doubled on each further attempt.
    pub backoff_base: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_retries: 5,
            capture_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Per-camera result of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraOutcome {
    Sent(SendOutcome),
    CaptureFailed,
    SendFailed,
}

/// Polls every configured camera and forwards frames to the station API.
pub struct EdgeClient<S: FrameSource> {
    uplink: Uplink,
    source: S,
    settings: ClientSettings,
    cameras: Vec<CameraSource>,
}

impl<S: FrameSource> EdgeClient<S> {
    pub fn new(
        uplink: Uplink,
        source: S,
        settings: ClientSettings,
        cameras: Vec<CameraSource>,
    ) -> Self {
        Self {
            uplink,
            source,
            settings,
            cameras,
        }
    }

    pub fn uplink(&self) -> &Uplink {
        &self.uplink
    }

    pub fn cameras(&self) -> &[CameraSource] {
        &self.cameras
    }

    /// Up to `max_retries` attempts with exponential backoff between them.
    pub async fn capture_with_retry(&self, rtsp_url: &str) -> Option<Vec<u8>> {
        let attempts = self.settings.max_retries.max(1);
        for attempt in 0..attempts {
            match self.source.capture(rtsp_url, self.settings.capture_timeout).await {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!(rtsp_url, attempt = attempt + 1, "capture failed: {:#}", e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(retry_delay(self.settings.backoff_base, attempt)).await;
                    }
                }
            }
        }
        error!(rtsp_url, "Failed to capture frame after {} attempts", attempts);
        None
    }

    pub async fn process_camera(&mut self, camera: &CameraSource) -> CameraOutcome {
        let Some(frame) = self.capture_with_retry(&camera.rtsp_url).await else {
            let message = format!("Failed to capture frame from {}", camera.rtsp_url);
            // The server only counts these; a lost report is not retried.
            let _ = self.uplink.report_error(&camera.camera_id, &message).await;
            return CameraOutcome::CaptureFailed;
        };
        debug!(camera_id = %camera.camera_id, bytes = frame.len(), "frame captured");
        match self.uplink.send_frame(&camera.camera_id, frame).await {
            Ok(outcome) => CameraOutcome::Sent(outcome),
            Err(_) => CameraOutcome::SendFailed,
        }
    }

    /// One pass over all cameras, in order.
    pub async fn run_cycle(&mut self) -> Vec<CameraOutcome> {
        let cameras = self.cameras.clone();
        let mut outcomes = Vec::with_capacity(cameras.len());
        for camera in &cameras {
            outcomes.push(self.process_camera(camera).await);
        }
        outcomes
    }

    /// Cycle until `shutdown` resolves, keeping cycle starts `interval` apart.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            cameras = self.cameras.len(),
            api_url = self.uplink.api_url(),
            interval_ms = self.settings.interval.as_millis() as u64,
            "edge client started"
        );
        loop {
            let started = Instant::now();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.run_cycle() => {}
            }
            let wait = self.settings.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("edge client stopped");
        Ok(())
    }
}
