//! Application configuration.
//!
//! Reads TOML from the `--config` path, or `filepump.toml` in the working
//! directory. A missing file or missing keys fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use filepump_service::{ClientConfig, ServerConfig, check_transfer_config};
use filepump_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_WATERMARK, TransferConfig};
use serde::{Deserialize, Serialize};

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "filepump.toml";

/// On-disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address `serve` listens on.
    pub bind_address: String,
    /// Address the client commands connect to.
    pub server_address: String,
    /// Directory `serve` lists, serves and stores into.
    pub storage_dir: PathBuf,
    /// Shared bearer token. `None` disables auth on the server.
    pub token: Option<String>,
    pub chunk_size: usize,
    /// Inter-chunk pacing in milliseconds.
    pub chunk_delay_ms: u64,
    pub progress_watermark: usize,
    pub call_timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:50051".into(),
            server_address: "127.0.0.1:50051".into(),
            storage_dir: PathBuf::from("files"),
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: 0,
            progress_watermark: DEFAULT_WATERMARK,
            call_timeout_secs: None,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, or the default file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        check_transfer_config(&config.transfer())?;
        Ok(config)
    }

    pub fn transfer(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            progress_watermark: self.progress_watermark,
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address.clone(),
            storage_dir: self.storage_dir.clone(),
            token: self.token.clone(),
            transfer: self.transfer(),
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            server_address: self.server_address.clone(),
            token: self.token.clone(),
            transfer: self.transfer(),
            call_timeout: self.call_timeout_secs.map(Duration::from_secs),
            ..ClientConfig::default()
        }
    }
}
