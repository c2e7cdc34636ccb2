use std::sync::Arc;

use qc_station::{
    AlertSink, AuthGate, BlobStore, InferenceEngine, IngestConfig, Ingestor, RecordStore,
    StationChecker,
};

/// Accepted request body size; frames are capped at 10 MiB, the rest is multipart framing.
pub const DEFAULT_MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

/// Collaborators the server is assembled from.
pub struct ServerParts {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub inference: Option<Arc<dyn InferenceEngine>>,
    pub alerts: Option<Arc<dyn AlertSink>>,
    pub ingest: IngestConfig,
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
}

impl ServerParts {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            blobs: None,
            inference: None,
            alerts: None,
            ingest: IngestConfig::default(),
            api_key: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub ingestor: Arc<Ingestor>,
    pub checker: Arc<StationChecker>,
    pub auth: Arc<AuthGate>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(parts: ServerParts) -> Self {
        let mut ingestor = Ingestor::new(parts.records.clone(), parts.ingest);
        if let Some(blobs) = &parts.blobs {
            ingestor = ingestor.with_blobs(blobs.clone());
        }
        if let Some(engine) = parts.inference {
            ingestor = ingestor.with_inference(engine);
        }

        let mut checker = StationChecker::new(parts.records.clone());
        if let Some(sink) = parts.alerts {
            checker = checker.with_alerts(sink);
        }

        Self {
            records: parts.records,
            blobs: parts.blobs,
            ingestor: Arc::new(ingestor),
            checker: Arc::new(checker),
            auth: Arc::new(AuthGate::new(parts.api_key)),
            max_body_bytes: parts.max_body_bytes,
        }
    }
}
