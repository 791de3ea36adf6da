mod assets;
mod params;
mod ytdlp;

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    params::{DownloadParams, FormatsParams, Params},
    ytdlp::{Downloader, FormatsResponse},
};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DOWNLOADER: &str = "yt-dlp";
const CORS_ALLOWED_METHODS: &str = "POST, GET, OPTIONS";
const CORS_ALLOWED_HEADERS: &str = "Content-Type";

#[derive(Clone)]
struct AppState {
    public_dir: Arc<PathBuf>,
    downloader: Arc<Downloader>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn missing_parameter(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    fn subprocess_failure(stderr: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Failed to fetch formats".to_string(),
            details: Some(stderr.into()),
        }
    }

    fn output_parse_failure(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Failed to parse JSON output".to_string(),
            details: Some(reason.into()),
        }
    }

    fn spawn_failure(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Failed to start downloader".to_string(),
            details: Some(reason.into()),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

struct Config {
    bind_addr: String,
    public_dir: PathBuf,
    downloader: Downloader,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "clip_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = load_config()?;

    if !tokio::fs::metadata(&config.public_dir)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
    {
        warn!(
            "Asset directory {:?} does not exist; static requests will answer 404.",
            config.public_dir
        );
    }
    info!("Downloader runs in {:?}", config.downloader.work_dir());

    let state = AppState {
        public_dir: Arc::new(config.public_dir.clone()),
        downloader: Arc::new(config.downloader),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!("Server running at http://{}/", config.bind_addr);
    info!("Serving files from {}", config.public_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health).fallback(fallback))
        .route("/api/formats", post(fetch_formats).fallback(fallback))
        .route("/api/download", post(start_download).fallback(fallback))
        .fallback(fallback)
        .with_state(state)
        .layer(build_cors_layer())
        .layer(SetResponseHeaderLayer::if_not_present(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(CORS_ALLOWED_METHODS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(CORS_ALLOWED_HEADERS),
        ))
        .layer(TraceLayer::new_for_http())
}

// Any OPTIONS request is answered by the layer itself. It only sends the
// allowed methods and headers on those preflight replies; the
// `SetResponseHeaderLayer`s above add them to every other response.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn fallback(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method == Method::GET {
        assets::serve_asset(&state.public_dir, uri.path()).await
    } else {
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}

async fn fetch_formats(
    State(state): State<AppState>,
    Params(params): Params<FormatsParams>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let url = params.validate()?;

    info!("Fetching formats for: {url}");
    let info = state.downloader.dump_metadata(&url).await?;

    Ok(Json(info.into_formats_response()))
}

async fn start_download(
    State(state): State<AppState>,
    Params(params): Params<DownloadParams>,
) -> Result<Response, ApiError> {
    let request = params.validate()?;
    let args = ytdlp::section_download_args(&request);

    info!("Starting download: {}", state.downloader.describe(&args));
    let body = state.downloader.stream_output(&args)?;

    Ok((
        [(CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        body,
    )
        .into_response())
}

fn load_config() -> Result<Config, ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

    let public_dir = env_value("PUBLIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join("public"));
    let work_dir = env_value("DOWNLOADER_WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join(".."));
    let command_line = env_value("YT_DLP_CMD").unwrap_or_else(|| DEFAULT_DOWNLOADER.to_string());
    let downloader = Downloader::from_command_line(&command_line, work_dir).ok_or_else(|| {
        ApiError::internal(format!("Invalid downloader command: {command_line:?}"))
    })?;

    Ok(Config {
        bind_addr: resolve_bind_addr(),
        public_dir,
        downloader,
    })
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = env_value("APP_ADDR") {
        return configured;
    }

    if let Some(port) = env_value("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
