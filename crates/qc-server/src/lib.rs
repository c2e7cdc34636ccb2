pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{AppState, ServerParts, DEFAULT_MAX_BODY_BYTES};

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, bind: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    info!(%bind, api_key = state.auth.is_configured(), "qc server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;
    Ok(())
}
