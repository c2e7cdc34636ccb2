use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use qc_proto::schema::{validate_check_submission, validate_rules_update};
use qc_proto::{DetectionRules, ValidationError};
use qc_server::{AppState, ServerParts, DEFAULT_MAX_BODY_BYTES};
use qc_station::{
    AlertDispatcher, AlertSink, BlobStore, FileBlobStore, HttpInferenceEngine, InferenceEngine,
    IngestConfig, MemoryBlobStore, MemoryRecordStore, RecordStore, StationChecker,
};
use qc_uplink::{
    cameras_from_env_json, cameras_from_file_json, doctor as uplink_doctor, parse_camera_arg,
    CameraSource, ClientSettings, EdgeClient, FfmpegSource, Uplink, UplinkConfig,
};

#[derive(Debug, Parser)]
#[command(name = "qc", version, about = "QC station vision: detection API and edge capture client")]
struct Cli {
    /// TOML config; built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve,
    /// Capture frames from RTSP cameras and forward them to the API.
    Client(ClientArgs),
    /// Validate the configuration.
    Doctor(ClientArgs),
    /// Print format, size and dimensions of an image as JSON.
    Inspect { image: String },
    /// Reconcile detections against rules offline and print the result.
    Check {
        #[arg(long)]
        rules: String,
        #[arg(long)]
        detections: String,
    },
}

#[derive(Debug, Default, Args)]
struct ClientArgs {
    #[arg(long, env = "API_URL")]
    api_url: Option<String>,
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Seconds between capture cycles.
    #[arg(long, env = "INTERVAL")]
    interval: Option<f64>,
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,
    /// camera_id:rtsp_url, repeatable.
    #[arg(long = "camera")]
    cameras: Vec<String>,
    /// JSON file of the form {"cameras": [...]}.
    #[arg(long)]
    cameras_file: Option<String>,
    /// JSON array of cameras.
    #[arg(long, env = "CAMERAS", hide_env_values = true)]
    cameras_json: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    server: ServerCfg,
    inference: InferenceCfg,
    storage: StorageCfg,
    client: ClientCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ServerCfg {
    bind: String,
    api_key: Option<String>,
    public_base_url: String,
    max_body_bytes: usize,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            api_key: None,
            public_base_url: "/api/vision/blobs".into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct InferenceCfg {
    url: Option<String>,
    timeout_ms: u64,
    confidence_threshold: f64,
}

impl Default for InferenceCfg {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 30_000,
            confidence_threshold: qc_vision::DEFAULT_SCORE_THRESHOLD,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageCfg {
    blob_dir: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ClientCfg {
    api_url: String,
    api_key: Option<String>,
    interval_s: f64,
    max_retries: u32,
    capture_timeout_s: f64,
    cameras: Vec<CameraSource>,
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".into(),
            api_key: None,
            interval_s: 2.0,
            max_retries: 5,
            capture_timeout_s: 10.0,
            cameras: Vec::new(),
        }
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()) };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

/// Client options after merging flags, environment and the config file.
#[derive(Debug)]
struct ResolvedClient {
    api_url: String,
    api_key: String,
    settings: ClientSettings,
    cameras: Vec<CameraSource>,
}

fn seconds(name: &str, v: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(v)
        .with_context(|| format!("{} must be a non-negative number of seconds, got {}", name, v))
}

/// Flags and environment win over the config file. Cameras come from the first
/// non-empty source: `--cameras-file`, `--camera`, `CAMERAS`, then `[[client.cameras]]`.
fn resolve_client(cfg: &ClientCfg, args: &ClientArgs) -> Result<ResolvedClient> {
    let cameras = if let Some(path) = &args.cameras_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read cameras file {}", path))?;
        cameras_from_file_json(&text)?
    } else if !args.cameras.is_empty() {
        args.cameras.iter().map(|c| parse_camera_arg(c)).collect::<Result<Vec<_>>>()?
    } else if let Some(text) = args.cameras_json.as_deref().filter(|t| !t.trim().is_empty()) {
        cameras_from_env_json(text)?
    } else {
        cfg.cameras.clone()
    };

    let settings = ClientSettings {
        interval: seconds("interval", args.interval.unwrap_or(cfg.interval_s))?,
        max_retries: args.max_retries.unwrap_or(cfg.max_retries),
        capture_timeout: seconds("capture_timeout_s", cfg.capture_timeout_s)?,
        ..ClientSettings::default()
    };

    Ok(ResolvedClient {
        api_url: args
            .api_url
            .clone()
            .unwrap_or_else(|| cfg.api_url.clone())
            .trim_end_matches('/')
            .to_string(),
        api_key: args
            .api_key
            .clone()
            .or_else(|| cfg.api_key.clone())
            .unwrap_or_default(),
        settings,
        cameras,
    })
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Serve => serve(&cfg).await?,
        Command::Client(args) => client(&cfg, &args).await?,
        Command::Doctor(args) => doctor(&cfg, &args)?,
        Command::Inspect { image } => inspect(&image)?,
        Command::Check { rules, detections } => check(&rules, &detections)?,
    }
    Ok(())
}

fn build_state(cfg: &Config) -> Result<AppState> {
    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let mut parts = ServerParts::new(records);

    let blobs: Arc<dyn BlobStore> = match &cfg.storage.blob_dir {
        Some(dir) => Arc::new(FileBlobStore::new(dir.clone())),
        None => Arc::new(MemoryBlobStore::new()),
    };
    parts.blobs = Some(blobs);

    let inference_timeout = Duration::from_millis(cfg.inference.timeout_ms);
    if let Some(url) = &cfg.inference.url {
        let http = HttpInferenceEngine::new(url.clone(), inference_timeout)?;
        info!(url = http.url(), timeout_ms = cfg.inference.timeout_ms, "inference engine");
        let engine: Arc<dyn InferenceEngine> = Arc::new(http);
        parts.inference = Some(engine);
    } else {
        warn!("inference.url not set; /api/vision/detect will answer SERVICE_UNAVAILABLE");
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(AlertDispatcher::new(Duration::from_secs(10))?);
    parts.alerts = Some(alerts);

    parts.ingest = IngestConfig {
        inference_timeout,
        score_threshold: cfg.inference.confidence_threshold,
        public_base_url: cfg.server.public_base_url.clone(),
    };
    parts.api_key = cfg.server.api_key.clone();
    parts.max_body_bytes = cfg.server.max_body_bytes;
    Ok(AppState::new(parts))
}

async fn serve(cfg: &Config) -> Result<()> {
    let bind: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("server.bind {:?}", cfg.server.bind))?;
    let state = build_state(cfg)?;
    if !state.auth.is_configured() {
        warn!("server.api_key not set; protected routes will reject every request");
    }
    qc_server::serve(state, bind).await
}

async fn client(cfg: &Config, args: &ClientArgs) -> Result<()> {
    let rc = resolve_client(&cfg.client, args)?;
    uplink_doctor::check_client(&rc.api_url, &rc.api_key, &rc.cameras, &rc.settings)?;
    let uplink = Uplink::new(UplinkConfig::new(rc.api_url, rc.api_key))?;
    let mut edge = EdgeClient::new(uplink, FfmpegSource, rc.settings, rc.cameras);
    for cam in edge.cameras() {
        info!(
            camera_id = %cam.camera_id,
            name = cam.name.as_deref().unwrap_or(""),
            rtsp_url = %cam.rtsp_url,
            "camera"
        );
    }
    if !edge.uplink().ping().await {
        warn!(
            api_url = edge.uplink().api_url(),
            "api not reachable yet; frames will be retried each cycle"
        );
    }
    edge.run(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

fn doctor(cfg: &Config, args: &ClientArgs) -> Result<()> {
    info!("doctor: starting");

    cfg.server
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind {:?} is not host:port", cfg.server.bind))?;
    if cfg.server.api_key.as_deref().map_or(true, str::is_empty) {
        warn!("doctor: server.api_key not set; protected routes are closed");
    }
    anyhow::ensure!(cfg.server.max_body_bytes > 0, "server.max_body_bytes must be > 0");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.inference.confidence_threshold),
        "inference.confidence_threshold must be within [0, 1]"
    );
    anyhow::ensure!(cfg.inference.timeout_ms > 0, "inference.timeout_ms must be > 0");
    if let Some(url) = &cfg.inference.url {
        anyhow::ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "inference.url must be http(s): {}",
            url
        );
    }
    if let Some(dir) = &cfg.storage.blob_dir {
        let p = std::path::Path::new(dir);
        if p.exists() {
            anyhow::ensure!(p.is_dir(), "storage.blob_dir is not a dir: {}", dir);
        }
    }

    let rc = resolve_client(&cfg.client, args)?;
    if rc.cameras.is_empty() {
        info!("doctor: no client cameras configured, skipping client checks");
    } else {
        uplink_doctor::check_client(&rc.api_url, &rc.api_key, &rc.cameras, &rc.settings)?;
    }

    info!("doctor: OK");
    Ok(())
}

fn inspect(path: &str) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("read image {}", path))?;
    let report = qc_vision::inspect::validate_image(&bytes);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn describe(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect::<Vec<_>>().join("; ")
}

fn read_json(path: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parse {} as JSON", path))
}

/// Rules in the shape accepted by `PUT /api/stations/:station_id/rules`.
fn rules_from_json(value: &Value) -> Result<DetectionRules> {
    let update = validate_rules_update(value)
        .map_err(|errs| anyhow::anyhow!("invalid rules: {}", describe(&errs)))?;
    let station_id = value
        .get("station_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::nil);
    Ok(update.into_rules(station_id, OffsetDateTime::now_utc()))
}

/// A bare array is taken as normalized vision objects.
fn evaluate_offline(rules: &Value, detections: Value) -> Result<Value> {
    let rules = rules_from_json(rules)?;
    let detections = if detections.is_array() {
        json!({ "objects": detections })
    } else {
        detections
    };
    let submission = validate_check_submission(&detections)
        .map_err(|errs| anyhow::anyhow!("invalid detections: {}", describe(&errs)))?;

    let checker = StationChecker::new(Arc::new(MemoryRecordStore::new()));
    let (result, source) = checker.evaluate(&rules, submission);
    Ok(json!({ "source": source, "result": result }))
}

fn check(rules_path: &str, detections_path: &str) -> Result<()> {
    let out = evaluate_offline(&read_json(rules_path)?, read_json(detections_path)?)?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sample_config_parses() {
        let cfg: Config = toml::from_str(include_str!("../../../qc.example.toml")).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.inference.timeout_ms, 30_000);
        assert_eq!(cfg.client.cameras.len(), 2);
        assert_eq!(cfg.client.cameras[0].camera_id, "fryer-cam");
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: Config = toml::from_str("[server]\napi_key = \"k\"\n").unwrap();
        assert_eq!(cfg.server.api_key.as_deref(), Some("k"));
        assert_eq!(cfg.server.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(cfg.client.max_retries, 5);
        assert!(cfg.inference.url.is_none());
        assert!(load_config(None).unwrap().client.cameras.is_empty());
    }

    #[test]
    fn load_config_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qc.toml");
        std::fs::write(&path, "[server\n").unwrap();
        assert!(load_config(path.to_str()).is_err());
    }

    #[test]
    fn camera_sources_follow_priority() {
        let mut cfg = ClientCfg::default();
        cfg.cameras = vec![CameraSource {
            camera_id: "cfg".into(),
            rtsp_url: "rtsp://cfg".into(),
            name: None,
        }];

        let args = ClientArgs {
            cameras: vec!["cli:rtsp://cli/1".into()],
            cameras_json: Some(r#"[{"camera_id":"env","rtsp_url":"rtsp://env"}]"#.into()),
            ..ClientArgs::default()
        };
        assert_eq!(resolve_client(&cfg, &args).unwrap().cameras[0].camera_id, "cli");

        let args = ClientArgs {
            cameras_json: args.cameras_json,
            ..ClientArgs::default()
        };
        assert_eq!(resolve_client(&cfg, &args).unwrap().cameras[0].camera_id, "env");

        let fallback = resolve_client(&cfg, &ClientArgs::default()).unwrap();
        assert_eq!(fallback.cameras[0].camera_id, "cfg");

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cams.json");
        let body = r#"{"cameras":[{"camera_id":"file","rtsp_url":"rtsp://f"}]}"#;
        std::fs::write(&file, body).unwrap();
        let args = ClientArgs {
            cameras_file: Some(file.to_string_lossy().into_owned()),
            cameras: vec!["cli:rtsp://cli/1".into()],
            ..ClientArgs::default()
        };
        assert_eq!(resolve_client(&cfg, &args).unwrap().cameras[0].camera_id, "file");
    }

    #[test]
    fn flags_override_file_values() {
        let cfg = ClientCfg {
            api_key: Some("from-file".into()),
            ..ClientCfg::default()
        };
        let args = ClientArgs {
            api_url: Some("https://qc.example.com/".into()),
            interval: Some(0.5),
            ..ClientArgs::default()
        };
        let rc = resolve_client(&cfg, &args).unwrap();
        assert_eq!(rc.api_url, "https://qc.example.com");
        assert_eq!(rc.api_key, "from-file");
        assert_eq!(rc.settings.interval, Duration::from_millis(500));
        assert_eq!(rc.settings.max_retries, 5);

        let bad = ClientArgs {
            interval: Some(-1.0),
            ..ClientArgs::default()
        };
        assert!(resolve_client(&cfg, &bad).is_err());
    }

    #[test]
    fn offline_check_reports_missing_items() {
        let rules = json!({
            "expected_items": [
                {"label": "fries", "required": true},
                {"label": "drink", "required": true}
            ],
            "confidence_threshold": 0.5
        });
        let detections = json!([
            {
                "label": "french fries",
                "confidence": 0.9,
                "bbox": {"x": 0.1, "y": 0.1, "width": 0.2, "height": 0.2}
            }
        ]);
        let out = evaluate_offline(&rules, detections).unwrap();
        assert_eq!(out["source"], "vision");
        assert_eq!(out["result"]["pass"], false);
        assert_eq!(out["result"]["missing"], json!(["drink"]));
    }

    #[test]
    fn offline_check_rejects_bad_rules() {
        let err = evaluate_offline(&json!({"expected_items": "nope"}), json!([])).unwrap_err();
        assert!(err.to_string().contains("expected_items"));
    }
}
