//! Media Receiver
//!
//! Upload endpoint for the media uploader: accepts one multipart file per
//! request under the `mediaFile` field, stores it on disk and serves it back
//! under `/uploads/<name>`.

pub mod config;
pub mod server;

pub use config::{Config, ServerConfig};
pub use server::{
    create_router, sanitize_filename, start_server, ReceiverError, UploadResponse, NO_FILE_MSG,
    UPLOADED_MSG,
};
