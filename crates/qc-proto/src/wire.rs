use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::records::{CameraStatus, ChecklistResult, VisionDetectedObject};
use crate::schema::ValidationError;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    pub detection_id: Uuid,
    pub station_id: Uuid,
    pub timestamp: String,
    pub objects: Vec<VisionDetectedObject>,
    /// Empty when no thumbnail was stored.
    pub thumbnail_url: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error_code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ValidationErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorBody {
    pub field: String,
    pub message: String,
}

impl From<&ValidationError> for ValidationErrorBody {
    fn from(e: &ValidationError) -> Self {
        Self {
            field: e.field.clone(),
            message: e.message.clone(),
        }
    }
}

/// One row of `GET /api/vision/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraHealthView {
    pub camera_id: String,
    pub station_id: Uuid,
    pub name: Option<String>,
    pub status: CameraStatus,
    pub last_frame_at: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthListResponse {
    pub success: bool,
    pub cameras: Vec<CameraHealthView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub success: bool,
    pub log_id: Uuid,
    pub station_id: Uuid,
    pub result: ChecklistResult,
    pub alerted: bool,
}
