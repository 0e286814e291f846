//! OpenDAL operators behind the attachment store

use anyhow::{bail, Context, Result};
use opendal::layers::{LoggingLayer, RetryLayer};
use opendal::Operator;

use stow_core::config::StorageConfig as CoreStorageConfig;

/// Connection settings for an S3-compatible attachment bucket
#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl StorageConfig {
    /// Combine the `[storage]` section with credentials loaded elsewhere.
    pub fn from_core(storage: &CoreStorageConfig, access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            endpoint: storage.endpoint.clone(),
            region: storage.region.clone(),
            bucket: storage.bucket.clone(),
            access_key_id: access_key_id.to_owned(),
            secret_access_key: secret_access_key.to_owned(),
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Operator for an S3 bucket holding sealed attachments.
///
/// The retry layer only covers individual requests; whole-asset retries are
/// driven by the transfer crate so that resumption can skip stored parts.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    Ok(Operator::new(builder)
        .with_context(|| format!("creating S3 operator for bucket {}", cfg.bucket))?
        .layer(LoggingLayer::default())
        .layer(RetryLayer::new().with_max_times(5).with_jitter())
        .finish())
}

/// In-process operator, used by the `memory` backend and tests.
pub fn build_memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating memory operator")?
        .layer(LoggingLayer::default())
        .finish())
}

/// Build the S3 operator described by the `[storage]` section.
///
/// Plain `http://` endpoints are refused when `enforce_tls` is set and
/// logged as a warning otherwise.
pub fn build_from_core_config(
    storage: &CoreStorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    check_endpoint(storage)?;
    build_operator(&StorageConfig::from_core(storage, access_key_id, secret_access_key))
}

fn check_endpoint(storage: &CoreStorageConfig) -> Result<()> {
    if !storage.endpoint.starts_with("http://") {
        return Ok(());
    }
    if storage.enforce_tls {
        bail!(
            "endpoint {} is plaintext HTTP but storage.enforce_tls is set; \
             use an https:// endpoint or disable enforce_tls for local buckets",
            storage.endpoint
        );
    }
    tracing::warn!(
        endpoint = %storage.endpoint,
        "attachment bucket reached over plaintext HTTP; request signatures are exposed"
    );
    Ok(())
}
