//! User-facing status: a persistent snapshot plus a per-record event stream.
//!
//! Only classified, human-readable summaries end up here. Raw transport and
//! storage errors stay in the logs.

use crate::connectivity::Connectivity;
use crate::record::RecordId;
use serde::Serialize;
use std::fmt;

pub const NO_FILE_MSG: &str = "No file to upload.";
pub const QUEUED_MSG: &str = "Added to offline queue. Will upload when online.";
pub const QUEUED_AT_RISK_MSG: &str =
    "Added to offline queue, but it could not be saved. It will be lost if the app closes.";
pub const DRAINING_MSG: &str = "Processing offline queue...";
pub const DRAINED_MSG: &str = "Offline queue processed successfully!";
pub const STILL_OFFLINE_MSG: &str = "Still offline. Queue remains.";
pub const DELIVERED_MSG: &str = "Upload successful";

/// Phase shown on the status surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Attempting,
    Queued,
    Draining,
    Delivered,
    Failed,
}

/// Classified failure, safe to show to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connectivity lost; the item stays queued
    Network,
    /// The server will never accept this item
    Rejected,
    /// Durable storage refused the write; the item only lives in memory
    Storage,
    /// The stored payload could not be decoded
    Encoding,
    /// Nothing to upload
    Empty,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = match self {
            FailureKind::Network => "the network connection was lost",
            FailureKind::Rejected => "the server rejected the file",
            FailureKind::Storage => "the offline queue could not be saved",
            FailureKind::Encoding => "the saved file is unreadable",
            FailureKind::Empty => "there was no file to upload",
        };
        f.write_str(summary)
    }
}

/// Per-record progress notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Attempting { id: RecordId, filename: String },
    Delivered { id: RecordId, filename: String, stored_as: Option<String> },
    Queued { id: RecordId, filename: String, persisted: bool },
    Failed { id: RecordId, filename: String, reason: FailureKind },
}

impl StatusEvent {
    pub fn id(&self) -> RecordId {
        match self {
            StatusEvent::Attempting { id, .. }
            | StatusEvent::Delivered { id, .. }
            | StatusEvent::Queued { id, .. }
            | StatusEvent::Failed { id, .. } => *id,
        }
    }
}

/// Snapshot backing the persistent status/message surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub message: String,
    pub pending: usize,
    pub connectivity: Connectivity,
}

impl EngineStatus {
    pub fn idle(pending: usize, connectivity: Connectivity) -> Self {
        Self {
            phase: Phase::Idle,
            message: String::new(),
            pending,
            connectivity,
        }
    }
}

pub fn attempting_msg(filename: &str) -> String {
    format!("Attempting to upload {filename}...")
}

pub fn uploaded_msg(filename: &str) -> String {
    format!("Uploaded: {filename}")
}

pub fn retry_msg(filename: &str) -> String {
    format!("Failed to upload {filename}. Will retry.")
}

pub fn failed_msg(filename: &str, reason: FailureKind) -> String {
    format!("Upload of {filename} failed: {reason}.")
}
