use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the receiver service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// HTTP endpoint and file storage settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base used to build the `url` returned for stored files
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Directory stored files are written to; created if missing
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Multipart field carrying the file
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

fn default_service_name() -> String {
    "media-receiver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_public_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_field_name() -> String {
    "mediaFile".to_string()
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024 // 100MB
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "media-receiver")?
            .add_source(config::File::with_name("config/receiver").required(false))
            .add_source(config::File::with_name("/etc/media-queue/receiver").required(false))
            // RECEIVER__SERVER__PORT -> server.port
            .add_source(
                config::Environment::with_prefix("RECEIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: default_public_base_url(),
            upload_dir: default_upload_dir(),
            field_name: default_field_name(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_enabled: true,
        }
    }
}
