use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use qc_proto::{wire::DetectResponse, VisionDetection};
use qc_vision::{
    inspect::{self, MAX_IMAGE_BYTES},
    normalize::transform_detection_results,
    resize::{self, EncodedImage, JPEG_QUALITY},
    Dimensions, DEFAULT_SCORE_THRESHOLD, INFERENCE_MAX,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::inference::InferenceEngine;
use crate::store::{BlobStore, RecordStore};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub inference_timeout: Duration,
    /// Raw scores must be strictly above this to be kept.
    pub score_threshold: f64,
    /// Prefix for thumbnail URLs in responses.
    pub public_base_url: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inference_timeout: Duration::from_secs(30),
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            public_base_url: "/api/vision/blobs".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameSubmission {
    pub camera_id: String,
    pub frame: Bytes,
}

/// Result of one pipeline step.
#[derive(Debug)]
pub enum StepOutcome<T> {
    Ok(T),
    /// Step failed without failing the ingestion.
    Degraded(String),
    Err(Error),
}

impl<T> StepOutcome<T> {
    fn settle(self, step: &'static str, warnings: &mut Vec<String>) -> Result<Option<T>> {
        match self {
            Self::Ok(v) => Ok(Some(v)),
            Self::Degraded(reason) => {
                warn!(step, %reason, "ingest step degraded");
                warnings.push(format!("{}: {}", step, reason));
                Ok(None)
            }
            Self::Err(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for StepOutcome<T> {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub detection: VisionDetection,
    /// Empty when no thumbnail was stored.
    pub thumbnail_url: String,
    pub warnings: Vec<String>,
}

impl IngestReport {
    pub fn to_response(&self) -> DetectResponse {
        DetectResponse {
            success: true,
            detection_id: self.detection.id,
            station_id: self.detection.station_id,
            timestamp: self.detection.timestamp.format(&Rfc3339).unwrap_or_default(),
            objects: self.detection.objects.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            processing_time_ms: self.detection.processing_time_ms,
        }
    }
}

pub fn thumbnail_key(station_id: Uuid, detection_id: Uuid) -> String {
    format!("thumbnails/{}/{}.jpg", station_id, detection_id)
}

pub struct Ingestor {
    records: Arc<dyn RecordStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    inference: Option<Arc<dyn InferenceEngine>>,
    health: HealthTracker,
    cfg: IngestConfig,
}

impl Ingestor {
    pub fn new(records: Arc<dyn RecordStore>, cfg: IngestConfig) -> Self {
        let health = HealthTracker::new(records.clone());
        Self {
            records,
            blobs: None,
            inference: None,
            health,
            cfg,
        }
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_inference(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        self.inference = Some(engine);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn thumbnail_url(&self, key: Option<&str>) -> String {
        match key {
            Some(k) => format!("{}/{}", self.cfg.public_base_url.trim_end_matches('/'), k),
            None => String::new(),
        }
    }

    pub async fn ingest(&self, sub: FrameSubmission) -> Result<IngestReport> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let mapping = self
            .records
            .get_camera(&sub.camera_id)
            .await?
            .ok_or_else(|| Error::NotRegistered(sub.camera_id.clone()))?;

        let dims = check_frame(&sub.frame)?;

        let fitted = self.fit_for_inference(&sub.frame, dims).await;
        let (infer_bytes, infer_dims) = match StepOutcome::from(fitted)
            .settle("resize", &mut warnings)?
            .flatten()
        {
            Some(EncodedImage { bytes, dimensions }) => (bytes, dimensions),
            None => (sub.frame.to_vec(), dims),
        };

        let raw = StepOutcome::from(self.infer(infer_bytes, infer_dims).await)
            .settle("inference", &mut warnings)?
            .unwrap_or_default();
        let objects = transform_detection_results(
            &raw,
            infer_dims.width,
            infer_dims.height,
            self.cfg.score_threshold,
        );
        debug!(
            camera_id = %sub.camera_id,
            raw = raw.len(),
            kept = objects.len(),
            "normalized detections"
        );

        let detection_id = Uuid::new_v4();
        let thumbnail_key = match &self.blobs {
            Some(blobs) => self
                .store_thumbnail(blobs.as_ref(), &sub.frame, mapping.station_id, detection_id)
                .await
                .settle("thumbnail", &mut warnings)?,
            None => None,
        };

        let timestamp = OffsetDateTime::now_utc();
        let detection = VisionDetection {
            id: detection_id,
            camera_id: mapping.camera_id.clone(),
            station_id: mapping.station_id,
            timestamp,
            objects,
            thumbnail_key: thumbnail_key.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        self.records.insert_detection(detection.clone()).await?;
        self.health.record_frame(&mapping.camera_id, Some(timestamp)).await?;

        info!(
            camera_id = %detection.camera_id,
            station_id = %detection.station_id,
            objects = detection.objects.len(),
            elapsed_ms = detection.processing_time_ms,
            "frame ingested"
        );
        let thumbnail_url = self.thumbnail_url(thumbnail_key.as_deref());
        Ok(IngestReport {
            detection,
            thumbnail_url,
            warnings,
        })
    }

    /// `Ok(None)` when the frame already fits the inference bound.
    async fn fit_for_inference(
        &self,
        frame: &Bytes,
        dims: Dimensions,
    ) -> Result<Option<EncodedImage>> {
        if !inspect::needs_resize(dims, INFERENCE_MAX) {
            return Ok(None);
        }
        let frame = frame.clone();
        let task = tokio::task::spawn_blocking(move || {
            resize::fit_jpeg(&frame, INFERENCE_MAX, JPEG_QUALITY)
        });
        let resized = task
            .await
            .map_err(|e| Error::Internal(format!("resize task: {}", e)))?
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        debug!(from = ?dims, to = ?resized.dimensions, "resized for inference");
        Ok(Some(resized))
    }

    async fn infer(
        &self,
        bytes: Vec<u8>,
        dims: Dimensions,
    ) -> Result<Vec<qc_vision::RawDetection>> {
        let engine = self
            .inference
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("inference engine not configured".into()))?;
        let timeout = self.cfg.inference_timeout;
        match tokio::time::timeout(timeout, engine.infer(bytes, dims.width, dims.height)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Upstream(format!(
                "inference timed out after {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn store_thumbnail(
        &self,
        blobs: &dyn BlobStore,
        original: &Bytes,
        station_id: Uuid,
        detection_id: Uuid,
    ) -> StepOutcome<String> {
        let original = original.clone();
        let task = tokio::task::spawn_blocking(move || resize::thumbnail(&original));
        let encoded = match task.await {
            Ok(Ok(img)) => img,
            Ok(Err(e)) => return StepOutcome::Degraded(e.to_string()),
            Err(e) => return StepOutcome::Degraded(format!("thumbnail task: {}", e)),
        };
        let key = thumbnail_key(station_id, detection_id);
        match blobs.put(&key, Bytes::from(encoded.bytes), "image/jpeg").await {
            Ok(_) => StepOutcome::Ok(key),
            Err(e) => StepOutcome::Degraded(e.to_string()),
        }
    }
}

/// First validation error decides the class; dimensions must be readable.
fn check_frame(frame: &[u8]) -> Result<Dimensions> {
    let report = inspect::validate_image(frame);
    if let Some(first) = report.errors.first() {
        let oversized =
            report.size > MAX_IMAGE_BYTES && report.format != inspect::ImageFormat::Unknown;
        return Err(if oversized {
            Error::TooLarge(first.clone())
        } else {
            Error::InvalidFormat(first.clone())
        });
    }
    report
        .dimensions
        .ok_or_else(|| Error::InvalidFormat("Could not read image dimensions".into()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use qc_proto::{BoundingBox, CameraMapping, CameraStatus};
    use qc_vision::{PixelBox, RawDetection};
    use time::macros::datetime;

    use super::*;
    use crate::health::compute_status;
    use crate::inference::StaticInferenceEngine;
    use crate::store::{BlobMeta, MemoryBlobStore, MemoryRecordStore, StoreError, StoreResult};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 160, 40]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80)
            .encode_image(&img)
            .unwrap();
        out
    }

    fn raw(label: &str, score: f64) -> RawDetection {
        RawDetection {
            label: label.into(),
            score,
            bbox: PixelBox {
                xmin: 8.0,
                ymin: 6.0,
                xmax: 40.0,
                ymax: 30.0,
            },
        }
    }

    async fn registered(store: &MemoryRecordStore) -> Uuid {
        let station = Uuid::new_v4();
        store
            .create_camera(CameraMapping {
                camera_id: "cam-1".into(),
                station_id: station,
                rtsp_url: "rtsp://10.0.0.5/stream".into(),
                name: Some("Prep line".into()),
                created_at: datetime!(2026-01-01 00:00 UTC),
                updated_at: datetime!(2026-01-01 00:00 UTC),
            })
            .await
            .unwrap();
        station
    }

    fn submit(frame: Vec<u8>) -> FrameSubmission {
        FrameSubmission {
            camera_id: "cam-1".into(),
            frame: Bytes::from(frame),
        }
    }

    /// Remembers the dimensions it was called with.
    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<(u32, u32)>>,
    }

    #[async_trait]
    impl InferenceEngine for RecordingEngine {
        async fn infer(
            &self,
            _jpeg: Vec<u8>,
            width: u32,
            height: u32,
        ) -> Result<Vec<RawDetection>> {
            self.seen.lock().unwrap().push((width, height));
            Ok(vec![raw("bun", 0.9)])
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl InferenceEngine for SlowEngine {
        async fn infer(&self, _jpeg: Vec<u8>, _w: u32, _h: u32) -> Result<Vec<RawDetection>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct BrokenBlobs;

    #[async_trait]
    impl BlobStore for BrokenBlobs {
        async fn put(&self, _key: &str, _bytes: Bytes, _ct: &str) -> StoreResult<BlobMeta> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn get(&self, _key: &str) -> StoreResult<Option<(Bytes, BlobMeta)>> {
            Ok(None)
        }
        async fn head(&self, _key: &str) -> StoreResult<Option<BlobMeta>> {
            Ok(None)
        }
        async fn delete(&self, _key: &str) -> StoreResult<bool> {
            Ok(false)
        }
        async fn list(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unknown_camera_is_not_registered() {
        let store = Arc::new(MemoryRecordStore::new());
        let ingestor = Ingestor::new(store, IngestConfig::default());
        let err = ingestor.ingest(submit(jpeg(64, 48))).await.unwrap_err();
        assert!(matches!(err, Error::NotRegistered(ref id) if id == "cam-1"));
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn unprocessable_frames_are_rejected_before_inference() {
        let store = Arc::new(MemoryRecordStore::new());
        let station = registered(&store).await;
        let engine = Arc::new(RecordingEngine::default());
        let ingestor =
            Ingestor::new(store.clone(), IngestConfig::default()).with_inference(engine.clone());

        let err = ingestor.ingest(submit(b"GIF89a....".to_vec())).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "Unsupported image format. Only JPEG and PNG are allowed");

        let err = ingestor.ingest(submit(Vec::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "Empty image data");

        let mut huge = vec![0xFF, 0xD8, 0xFF];
        huge.resize(MAX_IMAGE_BYTES + 1, 0);
        let err = ingestor.ingest(submit(huge)).await.unwrap_err();
        assert_eq!(err.status_code(), 413);
        assert!(err.to_string().contains("10MB limit"));

        assert!(engine.seen.lock().unwrap().is_empty());
        assert!(store.latest_detection(station).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_inference_is_service_unavailable() {
        let store = Arc::new(MemoryRecordStore::new());
        let station = registered(&store).await;
        let ingestor = Ingestor::new(store.clone(), IngestConfig::default());
        let err = ingestor.ingest(submit(jpeg(64, 48))).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
        assert_eq!(err.status_code(), 502);
        assert!(store.latest_detection(station).await.unwrap().is_none());
        assert!(store.get_health("cam-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inference_timeout_is_upstream_failure() {
        let store = Arc::new(MemoryRecordStore::new());
        registered(&store).await;
        let cfg = IngestConfig {
            inference_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let ingestor = Ingestor::new(store, cfg).with_inference(Arc::new(SlowEngine));
        let err = ingestor.ingest(submit(jpeg(64, 48))).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn successful_ingest_persists_detection_thumbnail_and_health() {
        let store = Arc::new(MemoryRecordStore::new());
        let station = registered(&store).await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let dets = vec![raw("bun", 0.9), raw("patty", 0.5), raw("cheese", 0.51)];
        let engine = StaticInferenceEngine::new(dets);
        let ingestor = Ingestor::new(store.clone(), IngestConfig::default())
            .with_inference(Arc::new(engine))
            .with_blobs(blobs.clone());

        let report = ingestor.ingest(submit(jpeg(80, 60))).await.unwrap();
        assert!(report.warnings.is_empty());

        let labels: Vec<_> = report.detection.objects.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["bun", "cheese"]);
        let expected = BoundingBox {
            x: 0.1,
            y: 0.1,
            width: 0.4,
            height: 0.4,
        };
        assert_eq!(report.detection.objects[0].bbox, expected);

        let key = thumbnail_key(station, report.detection.id);
        assert_eq!(report.detection.thumbnail_key.as_deref(), Some(key.as_str()));
        assert_eq!(report.thumbnail_url, format!("/api/vision/blobs/{}", key));
        assert!(blobs.head(&key).await.unwrap().is_some());

        assert_eq!(store.latest_detection(station).await.unwrap(), Some(report.detection.clone()));
        let health = store.get_health("cam-1").await.unwrap().unwrap();
        assert_eq!(health.last_frame_at, Some(report.detection.timestamp));
        assert_eq!(
            compute_status(health.last_frame_at, health.error_count, report.detection.timestamp),
            CameraStatus::Online
        );

        let resp = report.to_response();
        assert!(resp.success);
        assert_eq!(resp.station_id, station);
        assert_eq!(resp.objects.len(), 2);
    }

    #[tokio::test]
    async fn thumbnail_failure_is_not_fatal() {
        let store = Arc::new(MemoryRecordStore::new());
        registered(&store).await;
        let old = crate::health::HealthUpdate::Error {
            message: Some("old".into()),
        };
        store.upsert_health("cam-1", old).await.unwrap();
        let ingestor = Ingestor::new(store.clone(), IngestConfig::default())
            .with_inference(Arc::new(StaticInferenceEngine::default()))
            .with_blobs(Arc::new(BrokenBlobs));

        let report = ingestor.ingest(submit(jpeg(32, 32))).await.unwrap();
        assert_eq!(report.detection.thumbnail_key, None);
        assert_eq!(report.thumbnail_url, "");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("thumbnail:"));

        let health = store.get_health("cam-1").await.unwrap().unwrap();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.last_error, None);
    }

    #[tokio::test]
    async fn oversized_frames_are_resized_for_inference() {
        let store = Arc::new(MemoryRecordStore::new());
        registered(&store).await;
        let engine = Arc::new(RecordingEngine::default());
        let ingestor = Ingestor::new(store, IngestConfig::default()).with_inference(engine.clone());

        ingestor.ingest(submit(jpeg(2400, 1200))).await.unwrap();
        ingestor.ingest(submit(jpeg(640, 480))).await.unwrap();
        assert_eq!(*engine.seen.lock().unwrap(), vec![(1920, 960), (640, 480)]);
    }
}
