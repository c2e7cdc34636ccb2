use std::sync::Arc;

use qc_proto::{wire::CameraHealthView, CameraHealth, CameraMapping, CameraStatus};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::store::{RecordStore, StoreResult};

/// A camera with no frame for longer than this is offline.
pub const STALE_AFTER: Duration = Duration::seconds(60);

const UNKNOWN_ERROR: &str = "Unknown error";

/// Errors dominate; then no frame ever seen; then staleness.
pub fn compute_status(
    last_frame_at: Option<OffsetDateTime>,
    error_count: u32,
    now: OffsetDateTime,
) -> CameraStatus {
    if error_count > 0 {
        return CameraStatus::Error;
    }
    match last_frame_at {
        None => CameraStatus::Unknown,
        Some(t) if now - t > STALE_AFTER => CameraStatus::Offline,
        Some(_) => CameraStatus::Online,
    }
}

/// A single mutation applied inside the store's upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthUpdate {
    Frame { at: OffsetDateTime },
    Error { message: Option<String> },
}

impl HealthUpdate {
    pub fn apply(self, health: &mut CameraHealth) {
        match self {
            Self::Frame { at } => {
                health.last_frame_at = Some(at);
                health.error_count = 0;
                health.last_error = None;
            }
            Self::Error { message } => {
                health.error_count = health.error_count.saturating_add(1);
                health.last_error = Some(
                    message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                );
            }
        }
    }
}

/// Row for the health listing; a mapping without a health row reads as `unknown`.
pub fn camera_health_view(
    health: Option<&CameraHealth>,
    mapping: &CameraMapping,
    now: OffsetDateTime,
) -> CameraHealthView {
    let last_frame_at = health.and_then(|h| h.last_frame_at);
    let error_count = health.map(|h| h.error_count).unwrap_or(0);
    CameraHealthView {
        camera_id: mapping.camera_id.clone(),
        station_id: mapping.station_id,
        name: mapping.name.clone(),
        status: compute_status(last_frame_at, error_count, now),
        last_frame_at: last_frame_at.and_then(|t| t.format(&Rfc3339).ok()),
        error_count,
        last_error: health.and_then(|h| h.last_error.clone()),
    }
}

#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn RecordStore>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Mark a frame as received; clears any error state.
    pub async fn record_frame(
        &self,
        camera_id: &str,
        at: Option<OffsetDateTime>,
    ) -> StoreResult<CameraHealth> {
        let at = at.unwrap_or_else(OffsetDateTime::now_utc);
        let before = self.store.get_health(camera_id).await?;
        let health = self.store.upsert_health(camera_id, HealthUpdate::Frame { at }).await?;
        if before.map(|h| h.error_count > 0).unwrap_or(false) {
            debug!(camera_id = %camera_id, "camera recovered");
        }
        Ok(health)
    }

    pub async fn record_error(
        &self,
        camera_id: &str,
        message: Option<String>,
    ) -> StoreResult<CameraHealth> {
        let health = self
            .store
            .upsert_health(camera_id, HealthUpdate::Error { message })
            .await?;
        warn!(
            camera_id = %camera_id,
            error_count = health.error_count,
            last_error = health.last_error.as_deref().unwrap_or_default(),
            "camera error recorded"
        );
        Ok(health)
    }

    /// Every registered camera with its derived status, in camera-id order.
    pub async fn list(&self, now: OffsetDateTime) -> StoreResult<Vec<CameraHealthView>> {
        let cameras = self.store.list_cameras().await?;
        let health = self.store.list_health().await?;
        let mut views: Vec<_> = cameras
            .iter()
            .map(|m| camera_health_view(health.iter().find(|h| h.camera_id == m.camera_id), m, now))
            .collect();
        views.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use time::macros::datetime;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

    #[test]
    fn status_precedence() {
        assert_eq!(compute_status(None, 0, NOW), CameraStatus::Unknown);
        assert_eq!(compute_status(None, 3, NOW), CameraStatus::Error);
        assert_eq!(compute_status(Some(NOW), 1, NOW), CameraStatus::Error);
        assert_eq!(compute_status(Some(NOW), 0, NOW), CameraStatus::Online);
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let at_limit = NOW - Duration::milliseconds(60_000);
        let past_limit = NOW - Duration::milliseconds(60_001);
        assert_eq!(compute_status(Some(at_limit), 0, NOW), CameraStatus::Online);
        assert_eq!(compute_status(Some(past_limit), 0, NOW), CameraStatus::Offline);
        // a frame stamped in the future is still online
        assert_eq!(compute_status(Some(NOW + Duration::seconds(5)), 0, NOW), CameraStatus::Online);
    }

    #[test]
    fn updates_follow_record_rules() {
        let mut h = CameraHealth::new("cam");
        HealthUpdate::Error {
            message: Some("rtsp timeout".into()),
        }
        .apply(&mut h);
        HealthUpdate::Error { message: None }.apply(&mut h);
        assert_eq!(h.error_count, 2);
        assert_eq!(h.last_error.as_deref(), Some("Unknown error"));
        assert_eq!(h.last_frame_at, None);

        HealthUpdate::Frame { at: NOW }.apply(&mut h);
        let expected = CameraHealth {
            camera_id: "cam".into(),
            last_frame_at: Some(NOW),
            error_count: 0,
            last_error: None,
        };
        assert_eq!(h, expected);

        HealthUpdate::Error {
            message: Some("decode".into()),
        }
        .apply(&mut h);
        assert_eq!(h.last_frame_at, Some(NOW));
    }

    fn mapping(id: &str) -> CameraMapping {
        CameraMapping {
            camera_id: id.into(),
            station_id: Uuid::nil(),
            rtsp_url: "rtsp://cam".into(),
            name: Some("Line 1".into()),
            created_at: NOW,
            updated_at: NOW,
        }
    }

    #[tokio::test]
    async fn tracker_lists_registered_cameras_with_derived_status() {
        let store = Arc::new(MemoryRecordStore::new());
        store.create_camera(mapping("b")).await.unwrap();
        store.create_camera(mapping("a")).await.unwrap();
        store.create_camera(mapping("c")).await.unwrap();
        let tracker = HealthTracker::new(store.clone());

        tracker.record_frame("a", Some(NOW - Duration::seconds(10))).await.unwrap();
        tracker.record_frame("b", Some(NOW - Duration::seconds(120))).await.unwrap();
        // health rows for unmapped cameras are not listed
        tracker.record_error("ghost", None).await.unwrap();

        let views = tracker.list(NOW).await.unwrap();
        let summary: Vec<_> = views.iter().map(|v| (v.camera_id.as_str(), v.status)).collect();
        assert_eq!(
            summary,
            vec![
                ("a", CameraStatus::Online),
                ("b", CameraStatus::Offline),
                ("c", CameraStatus::Unknown)
            ]
        );
        assert_eq!(views[0].last_frame_at.as_deref(), Some("2026-03-01T11:59:50Z"));
        assert_eq!(views[2].name.as_deref(), Some("Line 1"));
    }

    #[tokio::test]
    async fn frame_after_errors_recovers() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = HealthTracker::new(store);
        tracker.record_error("cam", Some("boom".into())).await.unwrap();
        let h = tracker.record_error("cam", Some("boom again".into())).await.unwrap();
        assert_eq!(compute_status(h.last_frame_at, h.error_count, NOW), CameraStatus::Error);

        let h = tracker.record_frame("cam", Some(NOW)).await.unwrap();
        assert_eq!(compute_status(h.last_frame_at, h.error_count, NOW), CameraStatus::Online);
        assert_eq!(h.last_error, None);
    }
}
