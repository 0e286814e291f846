use serde::{Deserialize, Serialize};

use crate::error::StowError;

/// Smallest accepted multi-part part size (one plaintext chunk).
pub const MIN_PART_SIZE: u64 = 1024 * 1024;

/// Top-level configuration (loaded from stow.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowConfig {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind: "s3" or "memory"
    pub backend: String,
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Default bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Multi-part part size in bytes (default: 5 MiB)
    pub part_size: u64,
    /// Concurrent part uploads per asset
    pub max_concurrent_parts: usize,
    /// Retry limit for retryable failures
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "attachments".into(),
            enforce_tls: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: 5 * 1024 * 1024,
            max_concurrent_parts: 4,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl StowConfig {
    pub fn from_toml(content: &str) -> Result<Self, StowError> {
        let config: StowConfig =
            toml::from_str(content).map_err(|e| StowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StowError> {
        match self.storage.backend.as_str() {
            "s3" | "memory" => {}
            other => {
                return Err(StowError::Config(format!(
                    "unknown storage backend {other:?} (expected \"s3\" or \"memory\")"
                )))
            }
        }
        self.transfer.validate()?;
        match self.log.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(StowError::Config(format!(
                "unknown log format {other:?} (expected \"text\" or \"json\")"
            ))),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), StowError> {
        if self.part_size < MIN_PART_SIZE {
            return Err(StowError::Config(format!(
                "transfer.part_size must be at least {MIN_PART_SIZE} bytes, got {}",
                self.part_size
            )));
        }
        if self.max_concurrent_parts == 0 {
            return Err(StowError::Config(
                "transfer.max_concurrent_parts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
