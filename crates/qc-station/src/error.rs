use qc_proto::ValidationError;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Field-level problems in a request body.
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    /// Body was not parseable JSON at all.
    #[error("malformed JSON body: {0}")]
    MalformedBody(String),

    #[error("camera {0} is not registered")]
    NotRegistered(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidFormat(String),

    #[error("{0}")]
    TooLarge(String),

    /// No inference engine configured.
    #[error("inference service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Inference engine configured but the call failed or timed out.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Uniform for every rejection reason.
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::MalformedBody(_) | Self::InvalidFormat(_) => 400,
            Self::Unauthorized => 401,
            Self::NotRegistered(_) | Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::TooLarge(_) => 413,
            Self::ServiceUnavailable(_) | Self::Upstream(_) => 502,
            Self::Store(StoreError::NotFound(_)) => 404,
            Self::Store(StoreError::Conflict(_)) => 409,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MalformedBody(_) => "MALFORMED_JSON",
            Self::NotRegistered(_) => "CAMERA_NOT_REGISTERED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidFormat(_) => "INVALID_FORMAT",
            Self::TooLarge(_) => "TOO_LARGE",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            Self::Store(StoreError::Conflict(_)) => "CONFLICT",
            Self::Store(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
