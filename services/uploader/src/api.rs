use crate::config::ApiConfig;
use crate::engine::{DrainOutcome, QueueEngine, SubmitOutcome};
use crate::record::{MediaRecord, RecordId};
use crate::status::{self, EngineStatus, FailureKind};
use crate::store::DurableStore;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueueEngine>,
    pub store: Arc<dyn DurableStore>,
    pub field_name: String,
}

/// Pending queue entry, without the payload
#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub id: RecordId,
    pub filename: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
}

impl From<&MediaRecord> for QueueEntry {
    fn from(r: &MediaRecord) -> Self {
        Self {
            id: r.id,
            filename: r.filename.clone(),
            content_type: r.content_type.clone(),
            timestamp: r.created_at,
            size_bytes: r.approx_size_bytes(),
        }
    }
}

/// Queue listing response
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub pending: usize,
    pub draining: bool,
    pub records: Vec<QueueEntry>,
}

/// Submission response
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub outcome: &'static str,
    pub id: RecordId,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureKind>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/queue", get(list_queue))
        .route("/api/v1/queue/drain", post(drain_queue))
        .route("/api/v1/uploads", post(submit_upload))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "media-uploader"
    }))
}

/// Readiness: the durable store must answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

async fn list_queue(State(state): State<AppState>) -> Json<QueueResponse> {
    let records: Vec<QueueEntry> = state
        .engine
        .snapshot()
        .await
        .iter()
        .map(QueueEntry::from)
        .collect();

    Json(QueueResponse {
        pending: records.len(),
        draining: state.engine.is_draining(),
        records,
    })
}

#[instrument(skip(state))]
async fn drain_queue(State(state): State<AppState>) -> Json<DrainOutcome> {
    Json(state.engine.drain().await)
}

/// Accept one file under the configured multipart field and hand it to the engine
#[instrument(skip(state, multipart))]
async fn submit_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut file = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "Malformed multipart submission");
        bad_request(e.body_text(), "MALFORMED_MULTIPART")
    })? {
        if field.name() != Some(state.field_name.as_str()) {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(|e| {
            error!(error = %e, "Failed to read submitted file");
            bad_request(e.body_text(), "READ_ERROR")
        })?;

        file = Some((bytes.to_vec(), content_type, filename));
        break;
    }

    let Some((bytes, content_type, filename)) = file else {
        return Err(bad_request(status::NO_FILE_MSG.to_string(), "NO_FILE"));
    };

    let outcome = state
        .engine
        .submit(bytes, &content_type, filename.as_deref())
        .await;
    let message = state.engine.status().message;

    let response = match outcome {
        SubmitOutcome::Delivered { id, receipt } => (
            StatusCode::OK,
            SubmitResponse {
                outcome: "delivered",
                id,
                message,
                filename: receipt.filename,
                url: receipt.url,
                persisted: None,
                reason: None,
            },
        ),
        SubmitOutcome::Queued { id, persisted } => (
            StatusCode::ACCEPTED,
            SubmitResponse {
                outcome: "queued",
                id,
                message,
                filename: None,
                url: None,
                persisted: Some(persisted),
                reason: None,
            },
        ),
        SubmitOutcome::Failed { id, reason } => {
            let code = match reason {
                FailureKind::Empty => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (
                code,
                SubmitResponse {
                    outcome: "failed",
                    id,
                    message,
                    filename: None,
                    url: None,
                    persisted: None,
                    reason: Some(reason),
                },
            )
        }
    };

    Ok((response.0, Json(response.1)))
}

fn bad_request(error: String, code: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
}

/// Serve the submission API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting submission API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
