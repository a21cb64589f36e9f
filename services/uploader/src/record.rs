//! The durable unit of work and its storage-safe payload encoding.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors raised while converting a persisted payload back into bytes
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("payload is not a data URL")]
    NotDataUrl,

    #[error("data URL is not base64 encoded")]
    NotBase64,

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid content type {content_type:?}: {source}")]
    InvalidContentType {
        content_type: String,
        source: mime::FromStrError,
    },
}

/// Record identity: creation time in epoch milliseconds, bumped to stay unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing record identities.
///
/// Identities are wall-clock milliseconds; two captures inside the same
/// millisecond (or a clock stepping backwards) get `last + 1` instead.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure future identities sort after `id` (used after loading a queue)
    pub fn observe(&self, id: RecordId) {
        self.last.fetch_max(id.0, Ordering::SeqCst);
    }

    /// Next identity for a record created at `now`
    pub fn next(&self, now: DateTime<Utc>) -> RecordId {
        let candidate = now.timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);

        RecordId(candidate.max(previous + 1))
    }
}

/// A queued media item as persisted in the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Ordering key and UI key
    pub id: RecordId,
    /// Payload as a `data:<mime>;base64,<b64>` URL
    pub data: String,
    /// MIME type used to rebuild a typed upload on replay
    #[serde(rename = "type")]
    pub content_type: String,
    /// Human-readable file name
    pub filename: String,
    /// Capture/enqueue time
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl MediaRecord {
    /// Build a durable record from raw media bytes
    pub fn new(
        id: RecordId,
        bytes: &[u8],
        content_type: &str,
        filename: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Upload::new(id, bytes.to_vec(), content_type, filename).into_record(created_at)
    }

    /// Decode the persisted payload into a transport-ready upload
    pub fn to_upload(&self) -> Result<Upload, EncodingError> {
        let (_, bytes) = decode_data_url(&self.data)?;

        let upload = Upload {
            id: self.id,
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            bytes,
        };
        upload.validate()?;
        Ok(upload)
    }

    /// Size of the decoded payload, estimated from the base64 length
    pub fn approx_size_bytes(&self) -> usize {
        let encoded = self
            .data
            .split_once(',')
            .map(|(_, payload)| payload.trim_end_matches('='))
            .unwrap_or_default();
        encoded.len() * 3 / 4
    }
}

/// Raw bytes ready for a single delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub id: RecordId,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Build a transient upload that bypasses the queue
    pub fn new(
        id: RecordId,
        bytes: Vec<u8>,
        content_type: &str,
        filename: Option<&str>,
    ) -> Self {
        let filename = match filename {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => default_filename(content_type, id),
        };

        Self {
            id,
            filename,
            content_type: content_type.to_string(),
            bytes,
        }
    }

    /// Convert into a durable record for the offline queue
    pub fn into_record(self, created_at: DateTime<Utc>) -> MediaRecord {
        MediaRecord {
            id: self.id,
            data: encode_data_url(&self.content_type, &self.bytes),
            content_type: self.content_type,
            filename: self.filename,
            created_at,
        }
    }

    /// Check that the MIME type can be sent as a typed multipart part
    pub fn validate(&self) -> Result<(), EncodingError> {
        self.mime()
            .parse::<mime::Mime>()
            .map(|_| ())
            .map_err(|source| EncodingError::InvalidContentType {
                content_type: self.content_type.clone(),
                source,
            })
    }

    /// MIME type to send on the wire
    pub fn mime(&self) -> &str {
        if self.content_type.trim().is_empty() {
            FALLBACK_CONTENT_TYPE
        } else {
            &self.content_type
        }
    }
}

/// `upload-<id>.<subtype>`, or `.bin` when the MIME type has no subtype
pub fn default_filename(content_type: &str, id: RecordId) -> String {
    let extension = content_type
        .split('/')
        .nth(1)
        .map(|subtype| subtype.split(';').next().unwrap_or_default().trim())
        .filter(|subtype| !subtype.is_empty())
        .unwrap_or("bin");

    format!("upload-{}.{}", id, extension)
}

/// Encode bytes as a base64 data URL
pub fn encode_data_url(content_type: &str, bytes: &[u8]) -> String {
    let mime = if content_type.trim().is_empty() {
        FALLBACK_CONTENT_TYPE
    } else {
        content_type
    };

    format!(
        "{}{}{},{}",
        DATA_URL_PREFIX,
        mime,
        BASE64_MARKER,
        STANDARD.encode(bytes)
    )
}

/// Decode a base64 data URL into its MIME type and raw bytes
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), EncodingError> {
    let rest = data_url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or(EncodingError::NotDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(EncodingError::NotDataUrl)?;
    let mime = header
        .strip_suffix(BASE64_MARKER)
        .ok_or(EncodingError::NotBase64)?;

    let bytes = STANDARD.decode(payload.trim())?;
    Ok((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_default_filename_uses_subtype() {
        assert_eq!(default_filename("image/png", RecordId(42)), "upload-42.png");
        assert_eq!(
            default_filename("audio/webm;codecs=opus", RecordId(7)),
            "upload-7.webm"
        );
        assert_eq!(default_filename("", RecordId(1)), "upload-1.bin");
        assert_eq!(default_filename("weird", RecordId(1)), "upload-1.bin");
    }

    #[test]
    fn test_record_keeps_given_filename() {
        let record = MediaRecord::new(RecordId(5), b"abc", "video/webm", Some("clip.webm"), at(5));
        assert_eq!(record.filename, "clip.webm");

        let record = MediaRecord::new(RecordId(5), b"abc", "video/webm", Some("  "), at(5));
        assert_eq!(record.filename, "upload-5.webm");
    }

    #[test]
    fn test_data_url_shape() {
        assert_eq!(
            encode_data_url("text/plain", b"Hello World"),
            "data:text/plain;base64,SGVsbG8gV29ybGQ="
        );
        assert_eq!(
            encode_data_url("", b""),
            "data:application/octet-stream;base64,"
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(
            decode_data_url("SGVsbG8="),
            Err(EncodingError::NotDataUrl)
        ));
        assert!(matches!(
            decode_data_url("data:text/plain,hello"),
            Err(EncodingError::NotBase64)
        ));
        assert!(matches!(
            decode_data_url("data:text/plain;base64,@@@"),
            Err(EncodingError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_to_upload_restores_bytes_and_type() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let record = MediaRecord::new(RecordId(9), &bytes, "image/png", None, at(9));

        let upload = record.to_upload().unwrap();
        assert_eq!(upload.bytes, bytes);
        assert_eq!(upload.content_type, "image/png");
        assert_eq!(upload.filename, "upload-9.png");
        assert_eq!(record.approx_size_bytes(), 256);
    }

    #[test]
    fn test_content_type_must_parse_as_mime() {
        let typed = Upload::new(RecordId(1), vec![1], "image/png", None);
        assert!(typed.validate().is_ok());

        let untyped = Upload::new(RecordId(1), vec![1], "", None);
        assert!(untyped.validate().is_ok());

        let bare = Upload::new(RecordId(1), vec![1], "image", None);
        assert!(matches!(
            bare.validate(),
            Err(EncodingError::InvalidContentType { .. })
        ));

        let record = MediaRecord::new(RecordId(2), b"x", "image", Some("A"), at(2));
        assert!(matches!(
            record.to_upload(),
            Err(EncodingError::InvalidContentType { .. })
        ));
    }

    #[test]
    fn test_persisted_json_layout() {
        let record = MediaRecord::new(RecordId(1700000000000), b"Hi", "image/png", Some("a.png"), at(1700000000000));
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["id"], 1700000000000i64);
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["filename"], "a.png");
        assert_eq!(value["timestamp"], 1700000000000i64);
        assert_eq!(value["data"], "data:image/png;base64,SGk=");
    }

    #[test]
    fn test_id_generator_is_strictly_increasing() {
        let ids = IdGenerator::new();
        let now = at(1000);

        let a = ids.next(now);
        let b = ids.next(now);
        let c = ids.next(at(500));

        assert_eq!(a, RecordId(1000));
        assert_eq!(b, RecordId(1001));
        assert_eq!(c, RecordId(1002));
    }

    #[test]
    fn test_id_generator_respects_observed_ids() {
        let ids = IdGenerator::new();
        ids.observe(RecordId(5000));

        assert_eq!(ids.next(at(1000)), RecordId(5001));
        assert_eq!(ids.next(at(9000)), RecordId(9000));
    }
}
