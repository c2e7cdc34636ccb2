use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use qc_proto::{CameraHealth, CameraMapping, DetectionLog, DetectionRules, VisionDetection};
use tokio::{fs, sync::RwLock};
use uuid::Uuid;

use crate::health::HealthUpdate;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_camera(&self, camera_id: &str) -> StoreResult<Option<CameraMapping>>;
    async fn list_cameras(&self) -> StoreResult<Vec<CameraMapping>>;
    async fn create_camera(&self, mapping: CameraMapping) -> StoreResult<()>;
    async fn update_camera(&self, mapping: CameraMapping) -> StoreResult<()>;
    /// Removes the mapping plus its health row and detections.
    async fn delete_camera(&self, camera_id: &str) -> StoreResult<bool>;

    async fn get_health(&self, camera_id: &str) -> StoreResult<Option<CameraHealth>>;
    async fn list_health(&self) -> StoreResult<Vec<CameraHealth>>;
    /// Create-if-absent then apply `update`, atomically.
    async fn upsert_health(
        &self,
        camera_id: &str,
        update: HealthUpdate,
    ) -> StoreResult<CameraHealth>;

    async fn insert_detection(&self, detection: VisionDetection) -> StoreResult<()>;
    async fn latest_detection(&self, station_id: Uuid) -> StoreResult<Option<VisionDetection>>;

    async fn get_rules(&self, station_id: Uuid) -> StoreResult<Option<DetectionRules>>;
    async fn put_rules(&self, rules: DetectionRules) -> StoreResult<()>;

    async fn insert_log(&self, log: DetectionLog) -> StoreResult<()>;
    async fn list_logs(&self, station_id: Uuid) -> StoreResult<Vec<DetectionLog>>;
}

/// One `RwLock` per collection; each call is atomic on its own.
#[derive(Default)]
pub struct MemoryRecordStore {
    cameras: RwLock<BTreeMap<String, CameraMapping>>,
    health: RwLock<BTreeMap<String, CameraHealth>>,
    detections: RwLock<Vec<VisionDetection>>,
    rules: RwLock<HashMap<Uuid, DetectionRules>>,
    logs: RwLock<Vec<DetectionLog>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_camera(&self, camera_id: &str) -> StoreResult<Option<CameraMapping>> {
        Ok(self.cameras.read().await.get(camera_id).cloned())
    }

    async fn list_cameras(&self) -> StoreResult<Vec<CameraMapping>> {
        Ok(self.cameras.read().await.values().cloned().collect())
    }

    async fn create_camera(&self, mapping: CameraMapping) -> StoreResult<()> {
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(&mapping.camera_id) {
            return Err(StoreError::Conflict(mapping.camera_id));
        }
        cameras.insert(mapping.camera_id.clone(), mapping);
        Ok(())
    }

    async fn update_camera(&self, mapping: CameraMapping) -> StoreResult<()> {
        let mut cameras = self.cameras.write().await;
        match cameras.get_mut(&mapping.camera_id) {
            Some(slot) => {
                *slot = mapping;
                Ok(())
            }
            None => Err(StoreError::NotFound(mapping.camera_id)),
        }
    }

    async fn delete_camera(&self, camera_id: &str) -> StoreResult<bool> {
        let removed = self.cameras.write().await.remove(camera_id).is_some();
        if removed {
            self.health.write().await.remove(camera_id);
            self.detections.write().await.retain(|d| d.camera_id != camera_id);
        }
        Ok(removed)
    }

    async fn get_health(&self, camera_id: &str) -> StoreResult<Option<CameraHealth>> {
        Ok(self.health.read().await.get(camera_id).cloned())
    }

    async fn list_health(&self) -> StoreResult<Vec<CameraHealth>> {
        Ok(self.health.read().await.values().cloned().collect())
    }

    async fn upsert_health(
        &self,
        camera_id: &str,
        update: HealthUpdate,
    ) -> StoreResult<CameraHealth> {
        let mut health = self.health.write().await;
        let entry = health
            .entry(camera_id.to_string())
            .or_insert_with(|| CameraHealth::new(camera_id));
        update.apply(entry);
        Ok(entry.clone())
    }

    async fn insert_detection(&self, detection: VisionDetection) -> StoreResult<()> {
        let mut detections = self.detections.write().await;
        if detections.iter().any(|d| d.id == detection.id) {
            return Err(StoreError::Conflict(detection.id.to_string()));
        }
        detections.push(detection);
        Ok(())
    }

    async fn latest_detection(&self, station_id: Uuid) -> StoreResult<Option<VisionDetection>> {
        Ok(self
            .detections
            .read()
            .await
            .iter()
            .filter(|d| d.station_id == station_id)
            .max_by_key(|d| d.timestamp)
            .cloned())
    }

    async fn get_rules(&self, station_id: Uuid) -> StoreResult<Option<DetectionRules>> {
        Ok(self.rules.read().await.get(&station_id).cloned())
    }

    async fn put_rules(&self, rules: DetectionRules) -> StoreResult<()> {
        self.rules.write().await.insert(rules.station_id, rules);
        Ok(())
    }

    async fn insert_log(&self, log: DetectionLog) -> StoreResult<()> {
        self.logs.write().await.push(log);
        Ok(())
    }

    async fn list_logs(&self, station_id: Uuid) -> StoreResult<Vec<DetectionLog>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.station_id == station_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
    /// blake3 of the content, hex encoded.
    pub etag: String,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> StoreResult<BlobMeta>;
    async fn get(&self, key: &str) -> StoreResult<Option<(Bytes, BlobMeta)>>;
    async fn head(&self, key: &str) -> StoreResult<Option<BlobMeta>>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

fn etag(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// File-name prefix of in-flight writes in [`FileBlobStore`].
const TMP_PREFIX: &str = ".qc-tmp-";

/// Keys are relative `/`-separated paths without empty, `.` or `..` segments.
/// Segments may not start with the temp-file prefix.
pub fn check_key(key: &str) -> StoreResult<()> {
    let ok = !key.is_empty()
        && !key.contains('\\')
        && key.split('/').all(|seg| {
            !seg.is_empty() && seg != "." && seg != ".." && !seg.starts_with(TMP_PREFIX)
        });
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Nothing stored there: missing, a directory, or under a non-directory.
fn is_absent(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory | ErrorKind::NotADirectory)
}

fn content_type_for(key: &str) -> &'static str {
    match Path::new(key).extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, (Bytes, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> StoreResult<BlobMeta> {
        check_key(key)?;
        let meta = BlobMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: etag(&bytes),
            content_type: content_type.to_string(),
        };
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(meta)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<(Bytes, BlobMeta)>> {
        check_key(key)?;
        Ok(self.blobs.read().await.get(key).map(|(b, ct)| {
            let meta = BlobMeta {
                key: key.to_string(),
                size: b.len() as u64,
                etag: etag(b),
                content_type: ct.clone(),
            };
            (b.clone(), meta)
        }))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<BlobMeta>> {
        Ok(self.get(key).await?.map(|(_, meta)| meta))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        check_key(key)?;
        Ok(self.blobs.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Blobs as files under a root directory; the key is the relative path.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> StoreResult<BlobMeta> {
        let path = self.path_for(key)?;
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let data = bytes.clone();
        // unique sibling temp file, renamed into place once fully written
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::Builder::new().prefix(TMP_PREFIX).tempfile_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))??;
        Ok(BlobMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: etag(&bytes),
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<(Bytes, BlobMeta)>> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(m) if m.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match fs::read(&path).await {
            Ok(data) => {
                let meta = BlobMeta {
                    key: key.to_string(),
                    size: data.len() as u64,
                    etag: etag(&data),
                    content_type: content_type_for(key).to_string(),
                };
                Ok(Some((Bytes::from(data), meta)))
            }
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> StoreResult<Option<BlobMeta>> {
        Ok(self.get(key).await?.map(|(_, meta)| meta))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        if fs::metadata(&path).await.is_ok_and(|m| !m.is_file()) {
            return Ok(false);
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if is_absent(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        if !self.root.exists() {
            return Ok(keys);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(ent) = entries.next_entry().await? {
                let path = ent.path();
                if ent.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if ent.file_name().to_str().is_some_and(|n| n.starts_with(TMP_PREFIX)) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else { continue };
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_proto::{BoundingBox, VisionDetectedObject};
    use time::macros::datetime;

    fn mapping(id: &str, station: Uuid) -> CameraMapping {
        CameraMapping {
            camera_id: id.into(),
            station_id: station,
            rtsp_url: "rtsp://cam/stream".into(),
            name: Some(format!("Camera {}", id)),
            created_at: datetime!(2026-01-01 00:00 UTC),
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    fn detection(camera: &str, station: Uuid, ts: time::OffsetDateTime) -> VisionDetection {
        VisionDetection {
            id: Uuid::new_v4(),
            camera_id: camera.into(),
            station_id: station,
            timestamp: ts,
            objects: vec![VisionDetectedObject {
                label: "bun".into(),
                confidence: 0.9,
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 0.5,
                    height: 0.5,
                },
            }],
            thumbnail_key: None,
            processing_time_ms: 12,
        }
    }

    #[tokio::test]
    async fn camera_crud_and_cascade() {
        let store = MemoryRecordStore::new();
        let station = Uuid::new_v4();
        store.create_camera(mapping("a", station)).await.unwrap();
        assert_eq!(
            store.create_camera(mapping("a", station)).await,
            Err(StoreError::Conflict("a".into()))
        );

        let boom = HealthUpdate::Error {
            message: Some("boom".into()),
        };
        store.upsert_health("a", boom).await.unwrap();
        let det = detection("a", station, datetime!(2026-01-01 00:01 UTC));
        store.insert_detection(det).await.unwrap();

        assert!(store.delete_camera("a").await.unwrap());
        assert!(store.get_health("a").await.unwrap().is_none());
        assert!(store.latest_detection(station).await.unwrap().is_none());
        assert!(!store.delete_camera("a").await.unwrap());
    }

    #[tokio::test]
    async fn update_missing_camera_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store.update_camera(mapping("ghost", Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn latest_detection_picks_newest_for_station() {
        let store = MemoryRecordStore::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        store.insert_detection(detection("a", s1, datetime!(2026-01-01 00:01 UTC))).await.unwrap();
        let newest = detection("a", s1, datetime!(2026-01-01 00:03 UTC));
        store.insert_detection(newest.clone()).await.unwrap();
        store.insert_detection(detection("b", s2, datetime!(2026-01-01 00:05 UTC))).await.unwrap();
        store.insert_detection(detection("a", s1, datetime!(2026-01-01 00:02 UTC))).await.unwrap();

        assert_eq!(store.latest_detection(s1).await.unwrap(), Some(newest));
    }

    #[test]
    fn blob_keys_are_confined() {
        assert!(check_key("thumbnails/s/d.jpg").is_ok());
        for bad in ["", "/etc/passwd", "../x", "a/../../b", "a/./b", "a\\b"] {
            assert!(check_key(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn file_blob_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        let data = Bytes::from_static(b"\xFF\xD8\xFFthumb");

        let meta = store.put("thumbnails/s1/d1.jpg", data.clone(), "image/jpeg").await.unwrap();
        assert_eq!(meta.size, data.len() as u64);
        store.put("mats/s1.pdf", Bytes::from_static(b"%PDF"), "application/pdf").await.unwrap();

        let head = store.head("thumbnails/s1/d1.jpg").await.unwrap().unwrap();
        assert_eq!(head.etag, meta.etag);
        assert_eq!(head.content_type, "image/jpeg");

        let (bytes, _) = store.get("thumbnails/s1/d1.jpg").await.unwrap().unwrap();
        assert_eq!(bytes, data);

        assert_eq!(store.list("thumbnails/").await.unwrap(), vec!["thumbnails/s1/d1.jpg"]);
        assert_eq!(store.list("").await.unwrap().len(), 2);

        assert!(store.delete("thumbnails/s1/d1.jpg").await.unwrap());
        assert!(!store.delete("thumbnails/s1/d1.jpg").await.unwrap());
        assert!(store.head("thumbnails/s1/d1.jpg").await.unwrap().is_none());
        assert!(store.put("../escape.jpg", data, "image/jpeg").await.is_err());
    }

    #[tokio::test]
    async fn file_blob_store_lists_any_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        let part = Bytes::from_static(b"p");
        store.put("mats/s1.part", part, "application/octet-stream").await.unwrap();
        store.put("mats/s1.jpg", Bytes::from_static(b"j"), "image/jpeg").await.unwrap();

        assert!(store.head("mats/s1.part").await.unwrap().is_some());
        assert_eq!(store.list("mats/").await.unwrap(), vec!["mats/s1.jpg", "mats/s1.part"]);
        assert!(store.put("mats/.qc-tmp-x", Bytes::from_static(b"t"), "image/jpeg").await.is_err());
    }

    #[tokio::test]
    async fn file_blob_store_same_stem_puts_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        for round in 0..20u8 {
            let jpg = Bytes::from(vec![b'j', round]);
            let png = Bytes::from(vec![b'p', round]);
            let (a, b) = tokio::join!(
                store.put("thumbs/x.jpg", jpg.clone(), "image/jpeg"),
                store.put("thumbs/x.png", png.clone(), "image/png"),
            );
            a.unwrap();
            b.unwrap();
            assert_eq!(store.get("thumbs/x.jpg").await.unwrap().unwrap().0, jpg);
            assert_eq!(store.get("thumbs/x.png").await.unwrap().unwrap().0, png);
        }
        assert_eq!(store.list("").await.unwrap(), vec!["thumbs/x.jpg", "thumbs/x.png"]);
        let leftovers = std::fs::read_dir(dir.path().join("thumbs")).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[tokio::test]
    async fn file_blob_store_directories_are_not_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        store.put("mats/s1.jpg", Bytes::from_static(b"j"), "image/jpeg").await.unwrap();

        assert!(store.get("mats").await.unwrap().is_none());
        assert!(store.head("mats").await.unwrap().is_none());
        assert!(store.get("mats/s1.jpg/inner").await.unwrap().is_none());
        assert!(!store.delete("mats").await.unwrap());
        assert!(store.get("mats/s1.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_blob_store_lists_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("thumbnails/a/1.jpg", Bytes::from_static(b"1"), "image/jpeg").await.unwrap();
        store.put("thumbnails/b/2.jpg", Bytes::from_static(b"2"), "image/jpeg").await.unwrap();
        assert_eq!(store.list("thumbnails/a/").await.unwrap(), vec!["thumbnails/a/1.jpg"]);
        assert_eq!(store.head("thumbnails/b/2.jpg").await.unwrap().unwrap().size, 1);
    }
}
