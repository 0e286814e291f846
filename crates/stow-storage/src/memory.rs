//! In-process object store
//!
//! Implements the full multi-part protocol over hash maps and records how
//! many bytes each transfer actually pushed, so tests can assert that a
//! resumed upload skipped what storage already held.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use stow_core::Destination;

use crate::signer::{sign_request, RequestSigner};
use crate::store::{part_checksum, ByteRange, ObjectReader, ObjectStore, PartInfo, UploadId};

/// Bytes and requests received by a [`MemStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes received through PUT and part uploads
    pub bytes_received: u64,
    pub parts_received: u64,
    pub puts_received: u64,
    pub signed_requests: u64,
}

struct MemUpload {
    dest: Destination,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Default)]
struct MemState {
    objects: HashMap<Destination, Bytes>,
    uploads: BTreeMap<UploadId, MemUpload>,
    next_upload: u64,
    stats: TransferStats,
    failing_parts: u32,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    pub fn stats(&self) -> TransferStats {
        self.lock().map(|s| s.stats).unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut s) = self.lock() {
            s.stats = TransferStats::default();
        }
    }

    /// Make the next `count` part uploads fail with a transport error.
    pub fn fail_next_parts(&self, count: u32) {
        if let Ok(mut s) = self.lock() {
            s.failing_parts = count;
        }
    }

    /// Raw bytes of a completed object.
    pub fn object(&self, dest: &Destination) -> Option<Bytes> {
        self.lock().ok()?.objects.get(dest).cloned()
    }

    /// Overwrite a completed object, bypassing the protocol.
    pub fn replace_object(&self, dest: &Destination, data: Bytes) {
        if let Ok(mut s) = self.lock() {
            s.objects.insert(dest.clone(), data);
        }
    }

    /// Number of incomplete multi-part uploads.
    pub fn pending_uploads(&self) -> usize {
        self.lock().map(|s| s.uploads.len()).unwrap_or_default()
    }

    fn signed(
        &self,
        signer: &dyn RequestSigner,
        method: &str,
        dest: &Destination,
        detail: &str,
    ) -> Result<()> {
        sign_request(signer, method, dest, detail)?;
        self.lock()?.stats.signed_requests += 1;
        Ok(())
    }
}

fn upload_for<'a>(
    state: &'a mut MemState,
    dest: &Destination,
    upload: &UploadId,
) -> Result<&'a mut MemUpload> {
    match state.uploads.get_mut(upload) {
        Some(u) if &u.dest == dest => Ok(u),
        Some(_) => anyhow::bail!("upload {upload} belongs to another destination"),
        None => anyhow::bail!("no such upload: {upload}"),
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn put_object(
        &self,
        dest: &Destination,
        data: Bytes,
        signer: &dyn RequestSigner,
    ) -> Result<String> {
        let checksum = part_checksum(&data);
        self.signed(signer, "PUT", dest, &checksum)?;

        let mut state = self.lock()?;
        state.stats.bytes_received += data.len() as u64;
        state.stats.puts_received += 1;
        state.objects.insert(dest.clone(), data);
        Ok(checksum)
    }

    async fn get_object(
        &self,
        dest: &Destination,
        range: ByteRange,
        signer: &dyn RequestSigner,
    ) -> Result<ObjectReader> {
        self.signed(signer, "GET", dest, "")?;

        let data = self
            .lock()?
            .objects
            .get(dest)
            .cloned()
            .with_context(|| format!("object not found: {dest}"))?;
        let (start, end) = range.resolve(data.len() as u64)?;
        let body = data.slice(start as usize..end as usize);
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn head_object(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<Option<u64>> {
        self.signed(signer, "HEAD", dest, "")?;
        Ok(self.lock()?.objects.get(dest).map(|d| d.len() as u64))
    }

    async fn find_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<Option<UploadId>> {
        self.signed(signer, "GET", dest, "uploads")?;
        let state = self.lock()?;
        Ok(state
            .uploads
            .iter()
            .filter(|(_, u)| &u.dest == dest)
            .map(|(id, _)| id.clone())
            .next_back())
    }

    async fn initiate_multipart(
        &self,
        dest: &Destination,
        signer: &dyn RequestSigner,
    ) -> Result<UploadId> {
        self.signed(signer, "POST", dest, "uploads")?;
        let mut state = self.lock()?;
        state.next_upload += 1;
        let id = UploadId(format!("mem-{:08}", state.next_upload));
        state.uploads.insert(
            id.clone(),
            MemUpload {
                dest: dest.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!(dest = %dest, upload_id = %id, "initiated multipart upload");
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
        let checksum = part_checksum(&data);
        self.signed(
            signer,
            "PUT",
            dest,
            &format!("uploadId={upload}&partNumber={number}&checksum={checksum}"),
        )?;

        let mut state = self.lock()?;
        if state.failing_parts > 0 {
            state.failing_parts -= 1;
            anyhow::bail!("injected failure uploading part {number} of {upload}");
        }
        if number == 0 {
            anyhow::bail!("part numbers start at 1");
        }

        let len = data.len() as u64;
        upload_for(&mut state, dest, upload)?
            .parts
            .insert(number, (data, checksum.clone()));
        state.stats.bytes_received += len;
        state.stats.parts_received += 1;
        Ok(checksum)
    }

    async fn list_parts(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<Vec<PartInfo>> {
        self.signed(signer, "GET", dest, &format!("uploadId={upload}"))?;
        let mut state = self.lock()?;
        let parts = upload_for(&mut state, dest, upload)?
            .parts
            .iter()
            .map(|(number, (data, checksum))| PartInfo {
                number: *number,
                size: data.len() as u64,
                checksum: checksum.clone(),
            })
            .collect();
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        parts: &[PartInfo],
        signer: &dyn RequestSigner,
    ) -> Result<()> {
        self.signed(signer, "POST", dest, &format!("uploadId={upload}&complete"))?;
        let mut state = self.lock()?;

        let stored = upload_for(&mut state, dest, upload)?;
        let mut assembled = Vec::new();
        for part in parts {
            let (data, checksum) = stored
                .parts
                .get(&part.number)
                .with_context(|| format!("part {} missing from {upload}", part.number))?;
            if checksum != &part.checksum {
                anyhow::bail!("part {} checksum mismatch in {upload}", part.number);
            }
            assembled.extend_from_slice(data);
        }

        state.uploads.remove(upload);
        state.objects.insert(dest.clone(), Bytes::from(assembled));
        debug!(dest = %dest, upload_id = %upload, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> Result<()> {
        self.signed(signer, "DELETE", dest, &format!("uploadId={upload}"))?;
        let mut state = self.lock()?;
        upload_for(&mut state, dest, upload)?;
        state.uploads.remove(upload);
        Ok(())
    }
}
