use crate::config::ServerConfig;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

pub const UPLOADED_MSG: &str = "File uploaded successfully!";
pub const NO_FILE_MSG: &str = "No file uploaded.";

/// Errors returned by the upload handler
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("no file under field {0:?}")]
    NoFile(String),

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("failed to store file: {0}")]
    Io(#[from] std::io::Error),
}

/// Body of every upload response
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl UploadResponse {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            filename: None,
            url: None,
        }
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ReceiverError::NoFile(_) => (StatusCode::BAD_REQUEST, NO_FILE_MSG.to_string()),
            ReceiverError::Multipart(e) => (e.status(), e.body_text()),
            ReceiverError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store file.".to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error = %self, "Upload failed");
        } else {
            warn!(error = %self, "Upload refused");
        }

        (status, Json(UploadResponse::message(message))).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
}

/// Create the receiver router
pub fn create_router(config: &ServerConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    let state = AppState {
        config: Arc::new(config.clone()),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "media-receiver"
    }))
}

/// Store a single file under `<epoch-ms>-<sanitized name>`
#[instrument(skip(state, multipart))]
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ReceiverError> {
    let config = &state.config;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(config.field_name.as_str()) {
            continue;
        }

        let original = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        let stored_name = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_filename(&original)
        );
        let path: PathBuf = config.upload_dir.join(&stored_name);

        tokio::fs::create_dir_all(&config.upload_dir).await?;
        tokio::fs::write(&path, &bytes).await?;

        info!(
            filename = %stored_name,
            original = %original,
            content_type = ?content_type,
            size_bytes = bytes.len(),
            "File stored"
        );

        let url = format!(
            "{}/uploads/{}",
            config.public_base_url.trim_end_matches('/'),
            stored_name
        );
        return Ok(Json(UploadResponse {
            message: UPLOADED_MSG.to_string(),
            filename: Some(stored_name),
            url: Some(url),
        }));
    }

    Err(ReceiverError::NoFile(config.field_name.clone()))
}

/// Reduce a client-supplied name to a safe single path component
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Serve until `shutdown` is cancelled
pub async fn start_server(config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload directory {:?}", config.upload_dir))?;

    let router = create_router(config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, upload_dir = ?config.upload_dir, "Starting upload receiver");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Receiver server error")?;

    Ok(())
}
