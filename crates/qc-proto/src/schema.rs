use serde_json::{Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::records::{
    AlertConfig, BoundingBox, CameraHealth, CameraMapping, DetectedObject, DetectionRules,
    ExpectedItem, VisionDetectedObject, VisionDetection, DEFAULT_CONFIDENCE_THRESHOLD,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("{path}: missing required field")]
    Missing { path: String },
    #[error("{path}: expected {expected}")]
    Type {
        path: String,
        expected: &'static str,
    },
    #[error("{path}: {reason}")]
    Invalid { path: String, reason: String },
    #[error("malformed JSON: {0}")]
    Syntax(String),
}

impl SchemaError {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Missing { path } | Self::Type { path, .. } | Self::Invalid { path, .. } => {
                Some(path)
            }
            Self::Syntax(_) => None,
        }
    }
}

/// One violation found while validating a request body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<SchemaError> for ValidationError {
    fn from(e: SchemaError) -> Self {
        let field = e.path().unwrap_or("body").to_string();
        let message = match e {
            SchemaError::Missing { .. } => "missing required field".to_string(),
            SchemaError::Type { expected, .. } => format!("expected {}", expected),
            SchemaError::Invalid { reason, .. } => reason,
            SchemaError::Syntax(msg) => msg,
        };
        Self { field, message }
    }
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Outcome of a `validate_*` call: the value, or every violation found.
pub type Validated<T> = std::result::Result<T, Vec<ValidationError>>;

pub trait FromJson: Sized {
    fn from_json(value: &Value, path: &str) -> Result<Self>;
}

/// Parse text and decode it as `T`.
pub fn decode<T: FromJson>(text: &str) -> Result<T> {
    let value: Value = serde_json::from_str(text).map_err(|e| SchemaError::Syntax(e.to_string()))?;
    T::from_json(&value, "$")
}

pub fn decode_list<T: FromJson>(value: &Value, path: &str) -> Result<Vec<T>> {
    let arr = value.as_array().ok_or_else(|| type_err(path, "array"))?;
    arr.iter()
        .enumerate()
        .map(|(i, v)| T::from_json(v, &format!("{}[{}]", path, i)))
        .collect()
}

fn type_err(path: &str, expected: &'static str) -> SchemaError {
    SchemaError::Type {
        path: path.to_string(),
        expected,
    }
}

fn child(path: &str, name: &str) -> String {
    if path == "$" {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

/// Typed field access over one JSON object.
pub struct Fields<'a> {
    obj: &'a Map<String, Value>,
    path: &'a str,
}

impl<'a> Fields<'a> {
    pub fn of(value: &'a Value, path: &'a str) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| type_err(path, "object"))?;
        Ok(Self { obj, path })
    }

    fn present(&self, name: &str) -> Option<&'a Value> {
        self.obj.get(name).filter(|v| !v.is_null())
    }

    fn required(&self, name: &str) -> Result<&'a Value> {
        self.present(name).ok_or_else(|| SchemaError::Missing {
            path: child(self.path, name),
        })
    }

    pub fn path_of(&self, name: &str) -> String {
        child(self.path, name)
    }

    pub fn string(&self, name: &str) -> Result<String> {
        self.required(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_err(&child(self.path, name), "string"))
    }

    pub fn opt_string(&self, name: &str) -> Result<Option<String>> {
        match self.present(name) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| type_err(&child(self.path, name), "string")),
        }
    }

    pub fn boolean(&self, name: &str) -> Result<bool> {
        self.required(name)?.as_bool().ok_or_else(|| type_err(&child(self.path, name), "boolean"))
    }

    pub fn opt_boolean(&self, name: &str) -> Result<Option<bool>> {
        match self.present(name) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| type_err(&child(self.path, name), "boolean")),
        }
    }

    pub fn number(&self, name: &str) -> Result<f64> {
        self.required(name)?.as_f64().ok_or_else(|| type_err(&child(self.path, name), "number"))
    }

    pub fn opt_number(&self, name: &str) -> Result<Option<f64>> {
        match self.present(name) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| type_err(&child(self.path, name), "number")),
        }
    }

    pub fn unsigned(&self, name: &str) -> Result<u64> {
        self.required(name)?
            .as_u64()
            .ok_or_else(|| type_err(&child(self.path, name), "non-negative integer"))
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid> {
        let raw = self.string(name)?;
        Uuid::parse_str(&raw).map_err(|_| type_err(&child(self.path, name), "UUID string"))
    }

    pub fn timestamp(&self, name: &str) -> Result<OffsetDateTime> {
        let raw = self.string(name)?;
        OffsetDateTime::parse(&raw, &Rfc3339)
            .map_err(|_| type_err(&child(self.path, name), "RFC 3339 timestamp"))
    }

    pub fn opt_timestamp(&self, name: &str) -> Result<Option<OffsetDateTime>> {
        match self.opt_string(name)? {
            None => Ok(None),
            Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
                .map(Some)
                .map_err(|_| type_err(&child(self.path, name), "RFC 3339 timestamp")),
        }
    }

    pub fn list<T: FromJson>(&self, name: &str) -> Result<Vec<T>> {
        decode_list(self.required(name)?, &child(self.path, name))
    }

    pub fn nested<T: FromJson>(&self, name: &str) -> Result<Option<T>> {
        match self.present(name) {
            None => Ok(None),
            Some(v) => T::from_json(v, &child(self.path, name)).map(Some),
        }
    }
}

fn unit_interval(path: String, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(SchemaError::Invalid { path, reason: format!("{} is outside 0..1", value) })
    }
}

impl FromJson for ExpectedItem {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        let min_confidence = match f.opt_number("min_confidence")? {
            Some(v) => Some(unit_interval(f.path_of("min_confidence"), v)?),
            None => None,
        };
        Ok(Self {
            label: f.string("label")?,
            required: f.boolean("required")?,
            min_confidence,
        })
    }
}

impl FromJson for AlertConfig {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        Ok(Self {
            enabled: f.boolean("enabled")?,
            email: f.opt_string("email")?,
            webhook_url: f.opt_string("webhook_url")?,
            on_fail_only: f.opt_boolean("on_fail_only")?.unwrap_or(true),
        })
    }
}

impl FromJson for BoundingBox {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        Ok(Self {
            x: unit_interval(f.path_of("x"), f.number("x")?)?,
            y: unit_interval(f.path_of("y"), f.number("y")?)?,
            width: unit_interval(f.path_of("width"), f.number("width")?)?,
            height: unit_interval(f.path_of("height"), f.number("height")?)?,
        })
    }
}

impl FromJson for VisionDetectedObject {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        let bbox = f
            .nested::<BoundingBox>("bbox")?
            .ok_or_else(|| SchemaError::Missing {
                path: f.path_of("bbox"),
            })?;
        Ok(Self {
            label: f.string("label")?,
            confidence: unit_interval(f.path_of("confidence"), f.number("confidence")?)?,
            bbox,
        })
    }
}

impl FromJson for DetectedObject {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        let bbox_path = f.path_of("bbox");
        let raw = value
            .get("bbox")
            .and_then(Value::as_array)
            .ok_or_else(|| type_err(&bbox_path, "array of 4 integers"))?;
        if raw.len() != 4 {
            return Err(type_err(&bbox_path, "array of 4 integers"));
        }
        let mut bbox = [0i32; 4];
        for (slot, v) in bbox.iter_mut().zip(raw) {
            *slot = v
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| type_err(&bbox_path, "array of 4 integers"))?;
        }
        Ok(Self {
            label: f.string("label")?,
            confidence: unit_interval(f.path_of("confidence"), f.number("confidence")?)?,
            bbox,
        })
    }
}

impl FromJson for CameraHealth {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        let error_count = u32::try_from(f.unsigned("error_count")?)
            .map_err(|_| type_err(&f.path_of("error_count"), "32-bit non-negative integer"))?;
        Ok(Self {
            camera_id: f.string("camera_id")?,
            last_frame_at: f.opt_timestamp("last_frame_at")?,
            error_count,
            last_error: f.opt_string("last_error")?,
        })
    }
}

impl FromJson for CameraMapping {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        Ok(Self {
            camera_id: f.string("camera_id")?,
            station_id: f.uuid("station_id")?,
            rtsp_url: f.string("rtsp_url")?,
            name: f.opt_string("name")?,
            created_at: f.timestamp("created_at")?,
            updated_at: f.timestamp("updated_at")?,
        })
    }
}

impl FromJson for DetectionRules {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        let confidence_threshold = match f.opt_number("confidence_threshold")? {
            Some(v) => unit_interval(f.path_of("confidence_threshold"), v)?,
            None => DEFAULT_CONFIDENCE_THRESHOLD,
        };
        Ok(Self {
            station_id: f.uuid("station_id")?,
            expected_items: f.list("expected_items")?,
            confidence_threshold,
            alert_config: f.nested("alert_config")?,
            updated_at: f.timestamp("updated_at")?,
        })
    }
}

impl FromJson for VisionDetection {
    fn from_json(value: &Value, path: &str) -> Result<Self> {
        let f = Fields::of(value, path)?;
        Ok(Self {
            id: f.uuid("id")?,
            camera_id: f.string("camera_id")?,
            station_id: f.uuid("station_id")?,
            timestamp: f.timestamp("timestamp")?,
            objects: f.list("objects")?,
            thumbnail_key: f.opt_string("thumbnail_key")?,
            processing_time_ms: f.unsigned("processing_time_ms")?,
        })
    }
}

/// Camera registration body after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraRegistration {
    pub camera_id: String,
    pub station_id: Uuid,
    pub rtsp_url: String,
    pub name: Option<String>,
}

fn collect<T>(errors: &mut Vec<ValidationError>, res: Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(e.into());
            None
        }
    }
}

fn check_rtsp_url(errors: &mut Vec<ValidationError>, url: &str) {
    if !(url.starts_with("rtsp://") || url.starts_with("rtsps://")) {
        errors.push(ValidationError::new("rtsp_url", "must start with rtsp:// or rtsps://"));
    }
}

/// Validate a camera registration body, reporting every bad field.
pub fn validate_camera_registration(value: &Value) -> Validated<CameraRegistration> {
    let f = Fields::of(value, "$").map_err(|e| vec![ValidationError::from(e)])?;
    let mut errors = Vec::new();

    let camera_id = collect(&mut errors, f.string("camera_id"));
    if let Some(id) = &camera_id {
        if id.trim().is_empty() {
            errors.push(ValidationError::new("camera_id", "must not be empty"));
        }
    }
    let station_id = collect(&mut errors, f.uuid("station_id"));
    let rtsp_url = collect(&mut errors, f.string("rtsp_url"));
    if let Some(url) = &rtsp_url {
        check_rtsp_url(&mut errors, url);
    }
    let name = collect(&mut errors, f.opt_string("name"));

    match (camera_id, station_id, rtsp_url, name) {
        (Some(camera_id), Some(station_id), Some(rtsp_url), Some(name)) if errors.is_empty() => {
            Ok(CameraRegistration {
                camera_id,
                station_id,
                rtsp_url,
                name,
            })
        }
        _ => Err(errors),
    }
}

/// Partial camera update. Absent fields stay untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CameraUpdate {
    pub station_id: Option<Uuid>,
    pub rtsp_url: Option<String>,
    pub name: Option<String>,
}

pub fn validate_camera_update(value: &Value) -> Validated<CameraUpdate> {
    let f = Fields::of(value, "$").map_err(|e| vec![ValidationError::from(e)])?;
    let mut errors = Vec::new();

    let station_id = match f.opt_string("station_id") {
        Ok(Some(_)) => collect(&mut errors, f.uuid("station_id")),
        Ok(None) => None,
        Err(e) => {
            errors.push(e.into());
            None
        }
    };
    let rtsp_url = collect(&mut errors, f.opt_string("rtsp_url")).flatten();
    if let Some(url) = &rtsp_url {
        check_rtsp_url(&mut errors, url);
    }
    let name = collect(&mut errors, f.opt_string("name")).flatten();

    if errors.is_empty() {
        Ok(CameraUpdate {
            station_id,
            rtsp_url,
            name,
        })
    } else {
        Err(errors)
    }
}

/// Body of a rules replacement; the station comes from the route.
#[derive(Debug, Clone, PartialEq)]
pub struct RulesUpdate {
    pub expected_items: Vec<ExpectedItem>,
    pub confidence_threshold: f64,
    pub alert_config: Option<AlertConfig>,
}

impl RulesUpdate {
    pub fn into_rules(self, station_id: Uuid, updated_at: OffsetDateTime) -> DetectionRules {
        DetectionRules {
            station_id,
            expected_items: self.expected_items,
            confidence_threshold: self.confidence_threshold,
            alert_config: self.alert_config,
            updated_at,
        }
    }
}

pub fn validate_rules_update(value: &Value) -> Validated<RulesUpdate> {
    let f = Fields::of(value, "$").map_err(|e| vec![ValidationError::from(e)])?;
    let mut errors = Vec::new();
    let expected_items = collect(&mut errors, f.list::<ExpectedItem>("expected_items"));
    let threshold = collect(
        &mut errors,
        f.opt_number("confidence_threshold").and_then(|t| match t {
            Some(v) => unit_interval(f.path_of("confidence_threshold"), v),
            None => Ok(DEFAULT_CONFIDENCE_THRESHOLD),
        }),
    );
    let alert_config = collect(&mut errors, f.nested::<AlertConfig>("alert_config"));
    match (expected_items, threshold, alert_config) {
        (Some(expected_items), Some(confidence_threshold), Some(alert_config))
            if errors.is_empty() =>
        {
            Ok(RulesUpdate {
                expected_items,
                confidence_threshold,
                alert_config,
            })
        }
        _ => Err(errors),
    }
}

/// Capture failure reported by an edge client.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub camera_id: String,
    pub error: Option<String>,
}

pub fn validate_error_report(value: &Value) -> Validated<ErrorReport> {
    let f = Fields::of(value, "$").map_err(|e| vec![ValidationError::from(e)])?;
    let mut errors = Vec::new();
    let camera_id = collect(&mut errors, f.string("camera_id"));
    let error = collect(&mut errors, f.opt_string("error"));
    match (camera_id, error) {
        (Some(camera_id), Some(error)) if errors.is_empty() => Ok(ErrorReport { camera_id, error }),
        _ => Err(errors),
    }
}

/// Detections submitted for a station check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckSubmission {
    Vision(Vec<VisionDetectedObject>),
    Legacy(Vec<DetectedObject>),
}

/// Accepts `{"objects": [...]}` (normalized boxes) or `{"legacy_objects": [...]}` (pixel boxes).
/// Elements are decoded fail-fast; the top-level keys are checked together.
pub fn validate_check_submission(value: &Value) -> Validated<CheckSubmission> {
    let f = Fields::of(value, "$").map_err(|e| vec![ValidationError::from(e)])?;
    let has_vision = value.get("objects").is_some();
    let has_legacy = value.get("legacy_objects").is_some();
    match (has_vision, has_legacy) {
        (true, false) => f
            .list("objects")
            .map(CheckSubmission::Vision)
            .map_err(|e| vec![e.into()]),
        (false, true) => f
            .list("legacy_objects")
            .map(CheckSubmission::Legacy)
            .map_err(|e| vec![e.into()]),
        (true, true) => Err(vec![
            ValidationError::new("objects", "cannot be combined with legacy_objects"),
            ValidationError::new("legacy_objects", "cannot be combined with objects"),
        ]),
        (false, false) => Err(vec![ValidationError::new("objects", "missing required field")]),
    }
}
