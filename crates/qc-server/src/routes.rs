use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use qc_proto::wire::API_KEY_HEADER;
use qc_station::Error;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::handlers::*;
use crate::state::AppState;

/// Rejects with a uniform 401 unless `X-API-Key` matches the configured secret.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request.headers().get(API_KEY_HEADER).map(|v| v.as_bytes());
    match state.auth.verify(presented) {
        Ok(()) => next.run(request).await,
        Err(_) => ApiError(Error::Unauthorized).into_response(),
    }
}

pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/vision/health", get(health_list))
        .route("/api/vision/blobs/*key", get(get_blob));

    let protected_routes = Router::new()
        .route("/api/vision/detect", post(detect))
        .route("/api/vision/health/report", post(health_report))
        .route("/api/vision/cameras", get(list_cameras).post(create_camera))
        .route(
            "/api/vision/cameras/:camera_id",
            get(get_camera).put(update_camera).delete(delete_camera),
        )
        .route("/api/vision/latest/:station_id", get(latest_detection))
        .route("/api/stations/:station_id/check", post(station_check))
        .route("/api/stations/:station_id/rules", get(get_rules).put(put_rules))
        .route("/api/stations/:station_id/logs", get(list_logs))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
