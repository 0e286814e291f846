//! OpenDAL-backed object store
//!
//! OpenDAL hides multi-part uploads inside its writers and cannot list the
//! parts of an interrupted session, so sessions are staged as ordinary
//! objects instead:
//!
//! ```text
//! <key>.multipart/<upload_id>/session              session marker
//! <key>.multipart/<upload_id>/<number>-<checksum>.part
//! ```
//!
//! Upload ids start with a zero-padded millisecond timestamp, so the
//! lexicographically greatest session is the most recent. Completion streams
//! the parts through one OpenDAL writer into `<key>` and deletes the staging
//! prefix. OpenDAL authenticates with the operator's own credentials; the
//! injected signer still signs every request and a failing signer aborts it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use stow_core::Destination;

use crate::signer::{sign_request, RequestSigner};
use crate::store::{part_checksum, ByteRange, ObjectReader, ObjectStore, PartInfo, UploadId};

const STAGING_SUFFIX: &str = ".multipart/";
const PART_SUFFIX: &str = ".part";
const SESSION_MARKER: &str = "session";

pub struct OpendalStore {
    op: Operator,
    bucket: String,
}

impl OpendalStore {
    /// Wrap an operator rooted at `bucket`.
    pub fn new(op: Operator, bucket: impl Into<String>) -> Self {
        Self {
            op,
            bucket: bucket.into(),
        }
    }

    fn object_path(&self, dest: &Destination) -> Result<String> {
        if dest.bucket != self.bucket {
            anyhow::bail!(
                "bucket {:?} not served by this store (configured for {:?})",
                dest.bucket,
                self.bucket
            );
        }
        if dest.object_key.is_empty() || dest.object_key.ends_with('/') {
            anyhow::bail!("invalid object key {:?}", dest.object_key);
        }
        Ok(dest.object_key.clone())
    }

    fn staging_root(&self, dest: &Destination) -> Result<String> {
        Ok(format!("{}{STAGING_SUFFIX}", self.object_path(dest)?))
    }

    fn session_dir(&self, dest: &Destination, upload: &UploadId) -> Result<String> {
        Ok(format!("{}{}/", self.staging_root(dest)?, upload.0))
    }

    async fn require_session(&self, dest: &Destination, upload: &UploadId) -> Result<String> {
        let dir = self.session_dir(dest, upload)?;
        let marker = format!("{dir}{SESSION_MARKER}");
        match self.op.stat(&marker).await {
            Ok(_) => Ok(dir),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                anyhow::bail!("no such upload: {upload}")
            }
            Err(e) => Err(e).with_context(|| format!("checking upload session {dir}")),
        }
    }

    /// Staged part objects of a session, keyed by their storage path.
    async fn staged_parts(&self, dir: &str) -> Result<Vec<(String, u32, String)>> {
        let entries = self
            .op
            .list(dir)
            .await
            .with_context(|| format!("listing upload session {dir}"))?;

        let mut parts = Vec::new();
        for entry in entries {
            let path = entry.path();
            let name = path.strip_prefix(dir).unwrap_or(path);
            if name.is_empty() || name.ends_with('/') || name == SESSION_MARKER {
                continue;
            }
            match parse_part_name(name) {
                Some((number, checksum)) => parts.push((path.to_string(), number, checksum)),
                None => debug!(path, "ignoring non-part object in session"),
            }
        }
        parts.sort_by_key(|(_, number, _)| *number);
        Ok(parts)
    }

    async fn remove_prefix(&self, dir: &str) -> Result<()> {
        let entries = self
            .op
            .list_with(dir)
            .recursive(true)
            .await
            .with_context(|| format!("listing {dir} for removal"))?;
        for entry in entries {
            if entry.path().ends_with('/') {
                continue;
            }
            self.op
                .delete(entry.path())
                .await
                .with_context(|| format!("deleting {}", entry.path()))?;
        }
        Ok(())
    }
}

fn part_name(number: u32, checksum: &str) -> String {
    format!("{number:05}-{checksum}{PART_SUFFIX}")
}

fn parse_part_name(name: &str) -> Option<(u32, String)> {
    let stem = name.strip_suffix(PART_SUFFIX)?;
    let (number, checksum) = stem.split_once('-')?;
    Some((number.parse().ok()?, checksum.to_string()))
}

fn new_upload_id() -> UploadId {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    UploadId(format!("{millis:013}-{}", uuid::Uuid::new_v4().simple()))
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn put_object(
        &self,
        dest: &Destination,
        data: Bytes,
        signer: &dyn RequestSigner,
    ) -> Result<String> {
        let path = self.object_path(dest)?;
        let checksum = part_checksum(&data);
        sign_request(signer, "PUT", dest, &checksum)?;

        self.op
            .write(&path, data)
            .await
            .with_context(|| format!("writing object {path}"))?;
        Ok(checksum)
    }

    async fn get_object(
        &self,
        dest: &Destination,
        range: ByteRange,
        signer: &dyn RequestSigner,
    ) -> Result<ObjectReader> {
        let path = self.object_path(dest)?;
        sign_request(signer, "GET", dest, "")?;

        let len = self
            .op
            .stat(&path)
            .await
            .with_context(|| format!("stat {path}"))?
            .content_length();
        let (start, end) = range.resolve(len)?;

        let reader = self
            .op
            .reader(&path)
            .await
            .with_context(|| format!("opening reader for {path}"))?;
        let stream = reader
            .into_bytes_stream(start..end)
            .await
            .with_context(|| format!("streaming {path} [{start}..{end})"))?;
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn head_object(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<Option<u64>> {
        let path = self.object_path(dest)?;
        sign_request(signer, "HEAD", dest, "")?;

        match self.op.stat(&path).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat {path}")),
        }
    }

    async fn find_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<Option<UploadId>> {
        let root = self.staging_root(dest)?;
        sign_request(signer, "GET", dest, "uploads")?;

        let entries = match self.op.list_with(&root).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("listing {root}")),
        };

        Ok(entries
            .iter()
            .filter_map(|e| {
                e.path()
                    .strip_prefix(root.as_str())?
                    .strip_suffix(SESSION_MARKER)?
                    .strip_suffix('/')
            })
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(|id| UploadId(id.to_string()))
            .max())
    }

    async fn initiate_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<UploadId> {
        sign_request(signer, "POST", dest, "uploads")?;
        let id = new_upload_id();
        let marker = format!("{}{SESSION_MARKER}", self.session_dir(dest, &id)?);
        self.op
            .write(&marker, Vec::<u8>::new())
            .await
            .with_context(|| format!("creating upload session {marker}"))?;
        debug!(dest = %dest, upload_id = %id, "initiated staged multipart upload");
        Ok(id)
    }

    async fn upload_part(
        &self,
        dest: &Destination,
        upload: &UploadId,
        number: u32,
        data: Bytes,
        signer: &dyn RequestSigner,
    ) -> Result<String> {
        if number == 0 {
            anyhow::bail!("part numbers start at 1");
        }
        let checksum = part_checksum(&data);
        sign_request(
            signer,
            "PUT",
            dest,
            &format!("uploadId={upload}&partNumber={number}&checksum={checksum}"),
        )?;

        let dir = self.require_session(dest, upload).await?;
        for (path, existing, _) in self.staged_parts(&dir).await? {
            if existing == number {
                warn!(path = %path, "replacing staged part");
                self.op.delete(&path).await.with_context(|| format!("deleting {path}"))?;
            }
        }

        let path = format!("{dir}{}", part_name(number, &checksum));
        self.op
            .write(&path, data)
            .await
            .with_context(|| format!("writing part {path}"))?;
        Ok(checksum)
    }

    async fn list_parts(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<Vec<PartInfo>> {
        sign_request(signer, "GET", dest, &format!("uploadId={upload}"))?;
        let dir = self.require_session(dest, upload).await?;

        let mut parts = Vec::new();
        for (path, number, checksum) in self.staged_parts(&dir).await? {
            let size = self
                .op
                .stat(&path)
                .await
                .with_context(|| format!("stat {path}"))?
                .content_length();
            parts.push(PartInfo {
                number,
                size,
                checksum,
            });
        }
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        parts: &[PartInfo],
        signer: &dyn RequestSigner,
    ) -> Result<()> {
        sign_request(signer, "POST", dest, &format!("uploadId={upload}&complete"))?;
        let dir = self.require_session(dest, upload).await?;
        let path = self.object_path(dest)?;

        let mut writer = self
            .op
            .writer(&path)
            .await
            .with_context(|| format!("opening writer for {path}"))?;
        for part in parts {
            let part_path = format!("{dir}{}", part_name(part.number, &part.checksum));
            let data = self
                .op
                .read(&part_path)
                .await
                .with_context(|| format!("reading staged part {part_path}"))?
                .to_bytes();
            if part_checksum(&data) != part.checksum {
                anyhow::bail!("staged part {} of {upload} is corrupt", part.number);
            }
            writer
                .write(data)
                .await
                .with_context(|| format!("appending part {} to {path}", part.number))?;
        }
        writer
            .close()
            .await
            .with_context(|| format!("finalizing {path}"))?;

        self.remove_prefix(&dir).await?;
        debug!(dest = %dest, upload_id = %upload, parts = parts.len(), "completed staged multipart upload");
        Ok(())
    }

    async fn abort_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<()> {
        sign_request(signer, "DELETE", dest, &format!("uploadId={upload}"))?;
        let dir = self.require_session(dest, upload).await?;
        self.remove_prefix(&dir).await
    }
}
