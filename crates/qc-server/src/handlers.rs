use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use qc_proto::{
    schema::{
        validate_camera_registration, validate_camera_update, validate_check_submission,
        validate_error_report, validate_rules_update,
    },
    wire::{CheckResponse, DetectResponse, HealthListResponse},
    CameraMapping, ValidationError,
};
use qc_station::{Error, FrameSubmission};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Parse a JSON body; syntax problems are kept apart from field validation.
fn parse_json(body: &[u8]) -> ApiResult<Value> {
    serde_json::from_slice(body).map_err(|e| ApiError(Error::MalformedBody(e.to_string())))
}

fn parse_uuid(field: &str, raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| validation(vec![ValidationError::new(field, "expected UUID string")]))
}

fn validation(errors: Vec<ValidationError>) -> ApiError {
    ApiError(Error::Validation(errors))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn detect(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<DetectResponse>> {
    let mut multipart = multipart.map_err(|_| {
        validation(vec![ValidationError::new("body", "expected multipart/form-data")])
    })?;

    let mut camera_id = None;
    let mut frame = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(ApiError(Error::TooLarge(e.body_text())));
            }
            Err(e) => return Err(validation(vec![ValidationError::new("body", e.body_text())])),
        };
        let name = field.name().unwrap_or_default().to_string();
        let read = match name.as_str() {
            "camera_id" => field.text().await.map(|t| camera_id = Some(t)),
            "frame" => field.bytes().await.map(|b| frame = Some(b)),
            _ => continue,
        };
        if let Err(e) = read {
            return Err(if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError(Error::TooLarge(e.body_text()))
            } else {
                validation(vec![ValidationError::new(name, e.body_text())])
            });
        }
    }

    let mut errors = Vec::new();
    let camera_id = camera_id.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    if camera_id.is_none() {
        errors.push(ValidationError::new("camera_id", "missing required field"));
    }
    if frame.is_none() {
        errors.push(ValidationError::new("frame", "missing required field"));
    }
    let (Some(camera_id), Some(frame)) = (camera_id, frame) else {
        return Err(validation(errors));
    };

    let report = state.ingestor.ingest(FrameSubmission { camera_id, frame }).await?;
    Ok(Json(report.to_response()))
}

pub async fn health_list(State(state): State<AppState>) -> ApiResult<Json<HealthListResponse>> {
    let cameras = state.ingestor.health().list(OffsetDateTime::now_utc()).await?;
    Ok(Json(HealthListResponse {
        success: true,
        cameras,
    }))
}

pub async fn health_report(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let report = validate_error_report(&parse_json(&body)?).map_err(validation)?;
    if state.records.get_camera(&report.camera_id).await?.is_none() {
        return Err(ApiError(Error::NotRegistered(report.camera_id)));
    }
    let health = state
        .ingestor
        .health()
        .record_error(&report.camera_id, report.error)
        .await?;
    Ok(Json(json!({
        "success": true,
        "camera_id": health.camera_id,
        "error_count": health.error_count,
    })))
}

pub async fn list_cameras(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cameras = state.records.list_cameras().await?;
    Ok(Json(json!({ "success": true, "cameras": cameras })))
}

pub async fn create_camera(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let reg = validate_camera_registration(&parse_json(&body)?).map_err(validation)?;
    let now = OffsetDateTime::now_utc();
    let mapping = CameraMapping {
        camera_id: reg.camera_id.trim().to_string(),
        station_id: reg.station_id,
        rtsp_url: reg.rtsp_url,
        name: reg.name,
        created_at: now,
        updated_at: now,
    };
    state.records.create_camera(mapping.clone()).await?;
    info!(camera_id = %mapping.camera_id, station_id = %mapping.station_id, "camera registered");
    let body = Json(json!({ "success": true, "camera": mapping }));
    Ok((StatusCode::CREATED, body).into_response())
}

async fn camera_or_404(state: &AppState, camera_id: &str) -> ApiResult<CameraMapping> {
    state
        .records
        .get_camera(camera_id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("camera {}", camera_id))))
}

pub async fn get_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let camera = camera_or_404(&state, &camera_id).await?;
    Ok(Json(json!({ "success": true, "camera": camera })))
}

pub async fn update_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let update = validate_camera_update(&parse_json(&body)?).map_err(validation)?;
    let mut camera = camera_or_404(&state, &camera_id).await?;
    if let Some(station_id) = update.station_id {
        camera.station_id = station_id;
    }
    if let Some(url) = update.rtsp_url {
        camera.rtsp_url = url;
    }
    if let Some(name) = update.name {
        camera.name = Some(name);
    }
    camera.updated_at = OffsetDateTime::now_utc();
    state.records.update_camera(camera.clone()).await?;
    Ok(Json(json!({ "success": true, "camera": camera })))
}

pub async fn delete_camera(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.records.delete_camera(&camera_id).await? {
        return Err(ApiError(Error::NotFound(format!("camera {}", camera_id))));
    }
    info!(camera_id = %camera_id, "camera deleted");
    Ok(Json(json!({ "success": true })))
}

pub async fn latest_detection(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let station_id = parse_uuid("station_id", &station_id)?;
    let detection = state
        .records
        .latest_detection(station_id)
        .await?
        .ok_or_else(|| {
            ApiError(Error::NotFound(format!("no detections for station {}", station_id)))
        })?;
    let thumbnail_url = state.ingestor.thumbnail_url(detection.thumbnail_key.as_deref());
    Ok(Json(json!({
        "success": true,
        "detection": detection,
        "thumbnail_url": thumbnail_url,
    })))
}

pub async fn station_check(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<CheckResponse>> {
    let station_id = parse_uuid("station_id", &station_id)?;
    let submission = validate_check_submission(&parse_json(&body)?).map_err(validation)?;
    let outcome = state.checker.check(station_id, submission).await?;
    Ok(Json(CheckResponse {
        success: true,
        log_id: outcome.log.id,
        station_id,
        result: outcome.log.result,
        alerted: outcome.alerted,
    }))
}

pub async fn get_rules(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let station_id = parse_uuid("station_id", &station_id)?;
    let rules = state.checker.rules(station_id).await?;
    Ok(Json(json!({ "success": true, "rules": rules })))
}

pub async fn put_rules(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let station_id = parse_uuid("station_id", &station_id)?;
    let update = validate_rules_update(&parse_json(&body)?).map_err(validation)?;
    let rules = update.into_rules(station_id, OffsetDateTime::now_utc());
    let rules = state.checker.put_rules(rules).await?;
    Ok(Json(json!({ "success": true, "rules": rules })))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let station_id = parse_uuid("station_id", &station_id)?;
    let logs = state.checker.logs(station_id).await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let not_found = || ApiError(Error::NotFound(format!("blob {}", key)));
    let blobs = state.blobs.as_ref().ok_or_else(not_found)?;
    let (bytes, meta) = blobs
        .get(&key)
        .await
        .map_err(|e| match e {
            qc_station::StoreError::InvalidKey(_) => not_found(),
            other => ApiError::from(other),
        })?
        .ok_or_else(not_found)?;

    let mut resp = bytes.into_response();
    let headers = resp.headers_mut();
    if let Ok(ct) = HeaderValue::from_str(&meta.content_type) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, etag);
    }
    Ok(resp)
}
