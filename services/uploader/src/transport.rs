use crate::config::EndpointConfig;
use crate::record::Upload;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Classified failure of a single delivery attempt
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connectivity-layer failure; the upload may be queued and retried
    #[error("network failure: {0}")]
    Network(String),

    /// The endpoint refused the upload; retrying cannot succeed
    #[error("upload rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The upload could not be built locally; nothing was sent
    #[error("upload could not be built: {0}")]
    InvalidPayload(String),
}

impl TransportError {
    /// Whether the failure is eligible for the offline queue
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

/// Acknowledgement returned by the endpoint on success
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UploadReceipt {
    /// Name assigned by the endpoint
    #[serde(default)]
    pub filename: Option<String>,
    /// Where the stored file can be fetched
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Performs one delivery of one upload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn send(&self, upload: &Upload) -> Result<UploadReceipt, TransportError>;
}

/// Multipart HTTP transport posting to a fixed endpoint
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    field_name: String,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        config: &EndpointConfig,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        info!(
            endpoint = %config.url,
            field = %config.field_name,
            "Upload transport initialized"
        );

        Ok(Self {
            client,
            endpoint: config.url.clone(),
            field_name: config.field_name.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    #[instrument(skip(self, upload), fields(record_id = %upload.id, filename = %upload.filename))]
    async fn send(&self, upload: &Upload) -> Result<UploadReceipt, TransportError> {
        let part = Part::bytes(upload.bytes.clone())
            .file_name(upload.filename.clone())
            .mime_str(upload.mime())
            .map_err(|e| {
                TransportError::InvalidPayload(format!(
                    "invalid content type {:?}: {e}",
                    upload.content_type
                ))
            })?;
        let form = Form::new().part(self.field_name.clone(), part);

        debug!(size_bytes = upload.bytes.len(), "Posting upload");
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(classify_request_error)?;

        metrics::histogram!("uploader.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        // A 2xx is an acknowledgement even if the body is not the expected JSON.
        let receipt = response.json::<UploadReceipt>().await.unwrap_or_default();

        info!(
            status = status.as_u16(),
            stored_as = ?receipt.filename,
            "Upload delivered"
        );

        Ok(receipt)
    }
}

/// Failures before any response arrived are connectivity-layer failures
fn classify_request_error(error: reqwest::Error) -> TransportError {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    TransportError::Network(format!("{kind}: {error}"))
}

/// Map a non-2xx status to a failure class
fn classify_status(status: StatusCode, body: String) -> TransportError {
    match status {
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            TransportError::Network(format!("endpoint unavailable ({status})"))
        }
        _ => TransportError::Rejected {
            status: status.as_u16(),
            message: rejection_message(&body),
        },
    }
}

/// Prefer the endpoint's `message` field; fall back to the raw body
fn rejection_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string())
}
