use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// An item a station's rules expect to see in frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedItem {
    pub label: String,
    pub required: bool,
    /// Per-item override of the call-level threshold (vision checks only).
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// Detection produced by the legacy detector: pixel box as `[x, y, w, h]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f64,
    pub bbox: [i32; 4],
}

/// Box expressed as fractions (0..1) of the image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionDetectedObject {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItemResult {
    pub label: String,
    pub required: bool,
    pub found: bool,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChecklistResult {
    pub items: Vec<ChecklistItemResult>,
    pub found: Vec<String>,
    pub missing: Vec<String>,
    pub pass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraMapping {
    pub camera_id: String,
    pub station_id: Uuid,
    pub rtsp_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Liveness of a camera; always derived, see `qc_station::health::compute_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Unknown,
    Online,
    Offline,
    Error,
}

/// Raw health fields for one camera. Status is computed at read time, never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraHealth {
    pub camera_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_frame_at: Option<OffsetDateTime>,
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CameraHealth {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            last_frame_at: None,
            error_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionDetection {
    pub id: Uuid,
    pub camera_id: String,
    pub station_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub objects: Vec<VisionDetectedObject>,
    #[serde(default)]
    pub thumbnail_key: Option<String>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub enabled: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_on_fail_only")]
    pub on_fail_only: bool,
}

fn default_on_fail_only() -> bool {
    true
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

fn default_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRules {
    pub station_id: Uuid,
    pub expected_items: Vec<ExpectedItem>,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub alert_config: Option<AlertConfig>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    /// Normalized detections from the inference pipeline.
    Vision,
    /// Pixel-box detections from the legacy detector.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionLog {
    pub id: Uuid,
    pub station_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub result: ChecklistResult,
    pub source: DetectionSource,
}
