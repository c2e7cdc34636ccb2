pub mod client;
pub mod doctor;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use qc_proto::wire::{DetectResponse, API_KEY_HEADER};
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub use client::{
    retry_delay, CameraOutcome, CameraSource, ClientSettings, EdgeClient, FfmpegSource, FrameSource,
};

#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub rtt_ms: Option<u32>,
    pub quality: u8,           // 0-100
    pub consecutive_failures: u32,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            quality: 100,
            consecutive_failures: 0,
        }
    }
}

/// What the server said about one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Accepted(DetectResponse),
    /// 401: the API key was refused.
    Unauthorized,
    /// 404: the camera has no mapping on the server.
    NotRegistered,
    /// Any other non-success status.
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub api_url: String,
    pub api_key: String,
    pub frame_timeout: Duration,
    pub report_timeout: Duration,
}

impl UplinkConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            frame_timeout: Duration::from_secs(30),
            report_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP link from an edge box to the QC station API.
pub struct Uplink {
    client: reqwest::Client,
    api_url: String,
    api_key: Zeroizing<String>,
    frame_timeout: Duration,
    report_timeout: Duration,
    health: LinkHealth,
}

impl Uplink {
    pub fn new(cfg: UplinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build().context("build http client")?;
        Ok(Self {
            client,
            api_url: cfg.api_url,
            api_key: Zeroizing::new(cfg.api_key),
            frame_timeout: cfg.frame_timeout,
            report_timeout: cfg.report_timeout,
            health: LinkHealth::default(),
        })
    }

    pub fn link_health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// POST one JPEG to `/api/vision/detect` as multipart (`camera_id`, `frame`).
    pub async fn send_frame(&mut self, camera_id: &str, jpeg: Vec<u8>) -> Result<SendOutcome> {
        let start = Instant::now();
        let url = format!("{}/api/vision/detect", self.api_url);
        let size = jpeg.len();

        let result = async {
            let form = Form::new()
                .text("camera_id", camera_id.to_string())
                .part("frame", Part::bytes(jpeg).file_name("frame.jpg").mime_str("image/jpeg")?);
            let resp = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, self.api_key.as_str())
                .multipart(form)
                .timeout(self.frame_timeout)
                .send()
                .await?;

            let status = resp.status();
            let outcome = match status {
                StatusCode::OK => {
                    SendOutcome::Accepted(resp.json().await.context("decode detect response")?)
                }
                StatusCode::UNAUTHORIZED => SendOutcome::Unauthorized,
                StatusCode::NOT_FOUND => SendOutcome::NotRegistered,
                other => {
                    let body = resp.text().await.unwrap_or_default();
                    SendOutcome::Rejected {
                        status: other.as_u16(),
                        body: body.chars().take(200).collect(),
                    }
                }
            };
            Ok::<SendOutcome, anyhow::Error>(outcome)
        }
        .await;

        match &result {
            Ok(SendOutcome::Accepted(resp)) => {
                self.mark_success(start);
                info!(
                    camera_id,
                    objects = resp.objects.len(),
                    processing_ms = resp.processing_time_ms,
                    rtt_ms = self.health.rtt_ms.unwrap_or_default(),
                    "uplink: detection complete"
                );
            }
            Ok(SendOutcome::Unauthorized) => {
                self.mark_success(start);
                error!("uplink: authentication failed, check the API key");
            }
            Ok(SendOutcome::NotRegistered) => {
                self.mark_success(start);
                error!(camera_id, "uplink: camera not registered in the system");
            }
            Ok(SendOutcome::Rejected { status, body }) => {
                self.mark_success(start);
                warn!(camera_id, status, body = %body, "uplink: api error");
            }
            Err(e) => {
                self.mark_failure();
                warn!(
                    camera_id,
                    bytes = size,
                    failures = self.health.consecutive_failures,
                    quality = self.health.quality,
                    "uplink: send failed: {:#}",
                    e
                );
            }
        }
        result
    }

    /// Tell the server a camera could not be captured.
    pub async fn report_error(&mut self, camera_id: &str, message: &str) -> Result<()> {
        let url = format!("{}/api/vision/health/report", self.api_url);
        let body = serde_json::json!({ "camera_id": camera_id, "error": message });
        let result = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&body)
            .timeout(self.report_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(camera_id, "uplink: error reported");
                Ok(())
            }
            Ok(resp) => {
                warn!(camera_id, status = resp.status().as_u16(), "uplink: failed to report error");
                anyhow::bail!("health report returned {}", resp.status())
            }
            Err(e) => {
                self.mark_failure();
                warn!(camera_id, "uplink: could not reach health endpoint: {}", e);
                Err(e.into())
            }
        }
    }

    /// Calls `GET /healthz`; true on any 2xx.
    pub async fn ping(&self) -> bool {
        let url = format!("{}/healthz", self.api_url);
        let sent = self
            .client
            .get(&url)
            .timeout(self.report_timeout)
            .send()
            .await;
        match sent {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn mark_success(&mut self, start: Instant) {
        self.health.rtt_ms = Some(start.elapsed().as_millis() as u32);
        self.health.consecutive_failures = 0;
        self.health.quality = (self.health.quality + 10).min(100);
    }

    fn mark_failure(&mut self) {
        self.health.consecutive_failures += 1;
        self.health.quality = self.health.quality.saturating_sub(20);
    }
}

/// `{"cameras": [...]}` as found in a camera file.
#[derive(Debug, Deserialize)]
struct CameraFile {
    #[serde(default)]
    cameras: Vec<CameraSource>,
}

/// Cameras from a JSON file body.
pub fn cameras_from_file_json(text: &str) -> Result<Vec<CameraSource>> {
    let file: CameraFile = serde_json::from_str(text).context("parse camera file")?;
    Ok(file.cameras)
}

/// Cameras from the `CAMERAS` variable: a bare JSON array.
pub fn cameras_from_env_json(text: &str) -> Result<Vec<CameraSource>> {
    serde_json::from_str(text).context("parse CAMERAS as a JSON array")
}

/// `camera_id:rtsp_url`, split on the first colon.
pub fn parse_camera_arg(arg: &str) -> Result<CameraSource> {
    let (id, url) = arg
        .split_once(':')
        .with_context(|| format!("invalid camera {:?}, expected camera_id:rtsp_url", arg))?;
    anyhow::ensure!(
        !id.is_empty() && !url.is_empty(),
        "invalid camera {:?}, expected camera_id:rtsp_url",
        arg
    );
    Ok(CameraSource {
        camera_id: id.to_string(),
        rtsp_url: url.to_string(),
        name: None,
    })
}
