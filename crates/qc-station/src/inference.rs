use std::time::Duration;

use async_trait::async_trait;
use qc_vision::RawDetection;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Detections in pixel space of a `width` x `height` JPEG.
    async fn infer(&self, jpeg: Vec<u8>, width: u32, height: u32) -> Result<Vec<RawDetection>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InferReply {
    Bare(Vec<RawDetection>),
    Wrapped { detections: Vec<RawDetection> },
}

/// Posts the frame as multipart (`image`, `width`, `height`) and reads back
/// either a bare `RawDetection` array or `{"detections": [...]}`.
pub struct HttpInferenceEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpInferenceEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("build inference client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn infer(&self, jpeg: Vec<u8>, width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let upstream = |e: reqwest::Error| Error::Upstream(format!("inference request: {}", e));
        let part = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(upstream)?;
        let form = Form::new()
            .part("image", part)
            .text("width", width.to_string())
            .text("height", height.to_string());

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(upstream)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "inference returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        let reply: InferReply = resp.json().await.map_err(upstream)?;
        let detections = match reply {
            InferReply::Bare(d) | InferReply::Wrapped { detections: d } => d,
        };
        debug!(count = detections.len(), width, height, "inference reply");
        Ok(detections)
    }
}

/// Returns the same detections for every frame; for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInferenceEngine {
    detections: Vec<RawDetection>,
}

impl StaticInferenceEngine {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

#[async_trait]
impl InferenceEngine for StaticInferenceEngine {
    async fn infer(&self, _jpeg: Vec<u8>, _width: u32, _height: u32) -> Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }
}
