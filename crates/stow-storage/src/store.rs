//! Object-storage protocol consumed by the transfer orchestrator

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use stow_core::Destination;

use crate::signer::RequestSigner;

/// Streaming body of a GET.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Identifier of a multi-part upload session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadId(pub String);

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A part already accepted by storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// 1-based part number
    pub number: u32,
    pub size: u64,
    /// BLAKE3 of the part bytes (hex)
    pub checksum: String,
}

/// Byte range of a GET: `start..end`, or `start..` when `end` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Clamp to an object of `len` bytes. Fails if the range starts past the end.
    pub fn resolve(&self, len: u64) -> Result<(u64, u64)> {
        let end = self.end.map_or(len, |e| e.min(len));
        if self.start > end {
            anyhow::bail!("range start {} past object end {len}", self.start);
        }
        Ok((self.start, end))
    }
}

/// Checksum recorded for every part and single-shot object.
pub fn part_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Capability interface of a chunked object store.
///
/// Every call receives the request signer for the transfer it belongs to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single-shot PUT. Returns the object checksum.
    async fn put_object(
        &self,
        dest: &Destination,
        data: Bytes,
        signer: &dyn RequestSigner,
    ) -> Result<String>;

    async fn get_object(
        &self,
        dest: &Destination,
        range: ByteRange,
        signer: &dyn RequestSigner,
    ) -> Result<ObjectReader>;

    /// Size of a completed object, or `None` if it does not exist.
    async fn head_object(&self, dest: &Destination, signer: &dyn RequestSigner)
        -> Result<Option<u64>>;

    /// Most recent incomplete multi-part upload registered against `dest`.
    async fn find_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<Option<UploadId>>;

    async fn initiate_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<UploadId>;

    /// Upload part `number` (1-based). Returns the part checksum.
    async fn upload_part(
        &self,
        dest: &Destination,
        upload: &UploadId,
        number: u32,
        data: Bytes,
        signer: &dyn RequestSigner,
    ) -> Result<String>;

    /// Parts accepted so far, ordered by part number.
    async fn list_parts(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<Vec<PartInfo>>;

    /// Assemble `parts` (in order) into the final object.
    async fn complete_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        parts: &[PartInfo],
        signer: &dyn RequestSigner,
    ) -> Result<()>;

    async fn abort_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<()>;
}
