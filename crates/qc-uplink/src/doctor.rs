use anyhow::Result;

use crate::{CameraSource, ClientSettings};

pub fn check_api_url(api_url: &str) -> Result<()> {
    anyhow::ensure!(
        api_url.starts_with("http://") || api_url.starts_with("https://"),
        "client.api_url must be http(s): {}",
        api_url
    );
    Ok(())
}

pub fn check_cameras(cameras: &[CameraSource]) -> Result<()> {
    anyhow::ensure!(
        !cameras.is_empty(),
        "no cameras configured; use --camera, a cameras file or CAMERAS"
    );
    for cam in cameras {
        anyhow::ensure!(
            !cam.camera_id.trim().is_empty(),
            "camera with empty camera_id ({})",
            cam.rtsp_url
        );
        anyhow::ensure!(
            cam.rtsp_url.starts_with("rtsp://") || cam.rtsp_url.starts_with("rtsps://"),
            "camera {}: rtsp_url must start with rtsp:// or rtsps://",
            cam.camera_id
        );
    }
    Ok(())
}

pub fn check_client(
    api_url: &str,
    api_key: &str,
    cameras: &[CameraSource],
    settings: &ClientSettings,
) -> Result<()> {
    check_api_url(api_url)?;
    anyhow::ensure!(!api_key.is_empty(), "client.api_key is empty; set it or API_KEY");
    anyhow::ensure!(!settings.interval.is_zero(), "client.interval_s must be > 0");
    anyhow::ensure!(settings.max_retries >= 1, "client.max_retries must be >= 1");
    check_cameras(cameras)
}
