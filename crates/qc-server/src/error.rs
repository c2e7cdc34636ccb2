use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use qc_proto::wire::{ErrorBody, ValidationErrorBody};
use qc_station::{Error, StoreError};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(Error::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_code = self.0.error_code();
        let (message, details) = match &self.0 {
            Error::Validation(errors) => (
                "Request validation failed".to_string(),
                errors.iter().map(ValidationErrorBody::from).collect(),
            ),
            Error::Unauthorized => ("Unauthorized".to_string(), Vec::new()),
            other => (other.to_string(), Vec::new()),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error_code, message = %message, "Request error");
        } else {
            tracing::warn!(status = %status, error_code, message = %message, "Request rejected");
        }

        let body = ErrorBody {
            success: false,
            error_code: error_code.to_string(),
            message,
            details,
        };
        (status, Json(body)).into_response()
    }
}
