pub mod auth;
pub mod checks;
pub mod error;
pub mod health;
pub mod inference;
pub mod ingest;
pub mod store;

pub use auth::{AuthGate, AuthRejection};
pub use checks::{AlertDispatcher, AlertSink, CheckOutcome, StationChecker};
pub use error::{Error, Result};
pub use health::{compute_status, HealthTracker};
pub use inference::{HttpInferenceEngine, InferenceEngine, StaticInferenceEngine};
pub use ingest::{FrameSubmission, IngestConfig, IngestReport, Ingestor};
pub use store::{
    BlobStore, FileBlobStore, MemoryBlobStore, MemoryRecordStore, RecordStore, StoreError,
};
