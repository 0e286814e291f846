//! Resumable asset upload
//!
//! Sealed output is partitioned into fixed-size parts of a multi-part upload.
//! Sealing is deterministic for a given plaintext and key material, so a
//! retry that re-seals under the stashed keys of an interrupted session
//! produces byte-identical parts and only transfers the ones storage does not
//! already hold.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncSeekExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stow_core::config::TransferConfig;
use stow_core::{Asset, Destination, StowError, StowResult};
use stow_crypto::{encrypted_len, AssetKeys, SignEncrypter};
use stow_storage::{part_checksum, ObjectStore, PartInfo, RequestSigner, UploadId};

use crate::progress::ProgressTracker;
use crate::task::UploadTask;

/// Most parts a single multi-part upload may have (S3 limit).
pub const MAX_PARTS: u64 = 10_000;

/// Key material of an incomplete multi-part session.
struct StashedKeys {
    upload: UploadId,
    keys: AssetKeys,
}

/// Orchestrates encrypted uploads and verified downloads against an
/// [`ObjectStore`].
pub struct AttachmentStore {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    stash: Mutex<HashMap<Destination, StashedKeys>>,
}

/// Part boundaries of a sealed object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PartLayout {
    pub total: u64,
    pub part_size: u64,
}

impl PartLayout {
    pub(crate) fn count(&self) -> u64 {
        self.total.div_ceil(self.part_size)
    }

    /// Expected size of 1-based part `number`, or `None` if out of range.
    pub(crate) fn size_of(&self, number: u32) -> Option<u64> {
        let number = u64::from(number);
        if number == 0 || number > self.count() {
            return None;
        }
        let start = (number - 1) * self.part_size;
        Some(self.part_size.min(self.total - start))
    }
}

/// Session an upload attempt writes into.
struct Session {
    upload: UploadId,
    /// Keys to re-seal with; `None` starts a fresh encryption.
    keys: Option<AssetKeys>,
    accepted: BTreeMap<u32, PartInfo>,
}

enum Attempt {
    Done(Asset),
    /// A part storage holds differs from what re-sealing produced.
    Stale(UploadId),
}

impl AttachmentStore {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self {
            store,
            config,
            stash: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Whether key material for an interrupted upload to `dest` is held.
    pub fn has_resumable(&self, dest: &Destination) -> bool {
        self.stash_lock().contains_key(dest)
    }

    fn stash_lock(&self) -> std::sync::MutexGuard<'_, HashMap<Destination, StashedKeys>> {
        self.stash.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stashed_keys(&self, dest: &Destination, upload: &UploadId) -> Option<AssetKeys> {
        self.stash_lock()
            .get(dest)
            .filter(|s| &s.upload == upload)
            .map(|s| s.keys.clone())
    }

    fn stash_keys(&self, dest: &Destination, upload: &UploadId, keys: &AssetKeys) {
        self.stash_lock().insert(
            dest.clone(),
            StashedKeys {
                upload: upload.clone(),
                keys: keys.clone(),
            },
        );
    }

    fn forget_keys(&self, dest: &Destination) {
        self.stash_lock().remove(dest);
    }

    /// Encrypt `task.plaintext` from its current position and store it at
    /// `task.destination`.
    ///
    /// On cancellation the multi-part session stays registered in storage,
    /// and a later call for the same destination and plaintext resumes it.
    pub async fn upload_asset(
        &self,
        cancel: &CancellationToken,
        task: &mut UploadTask,
    ) -> StowResult<Asset> {
        self.config.validate()?;
        let total = encrypted_len(task.local.size);
        let dest = task.destination.clone();

        info!(
            dest = %dest,
            file = %task.local.filename,
            conversation = %task.conversation_hex(),
            plaintext = task.local.size,
            sealed = total,
            "uploading asset"
        );

        let token = cancel.child_token();
        let asset = if total <= self.config.part_size {
            self.upload_single(&token, task, total).await?
        } else {
            self.upload_multipart(&token, task, total).await?
        };

        info!(dest = %dest, sealed = asset.size, "asset uploaded");
        Ok(asset)
    }

    async fn upload_single(
        &self,
        token: &CancellationToken,
        task: &mut UploadTask,
        total: u64,
    ) -> StowResult<Asset> {
        let mut progress = ProgressTracker::new(total, task.progress.clone(), token.clone());
        let mut encrypter = SignEncrypter::new();
        let stream = encrypter.encrypt(&mut task.plaintext);
        let keys = stream.keys().clone();
        let sealed = stream.read_to_end().await?;
        check_sealed_len(sealed.len() as u64, total)?;
        progress.check_canceled()?;

        let dest = &task.destination;
        tokio::select! {
            _ = token.cancelled() => return Err(StowError::Canceled),
            put = self.store.put_object(dest, Bytes::from(sealed), &*task.signer) => {
                put.map_err(StowError::transfer)?;
            }
        }
        debug!(dest = %dest, bytes = total, "stored asset in a single request");
        self.forget_keys(dest);
        progress.advance(total)?;

        Ok(asset_for(dest, total, &keys))
    }

    async fn upload_multipart(
        &self,
        token: &CancellationToken,
        task: &mut UploadTask,
        total: u64,
    ) -> StowResult<Asset> {
        let layout = PartLayout {
            total,
            part_size: self.config.part_size,
        };
        if layout.count() > MAX_PARTS {
            return Err(StowError::Config(format!(
                "asset needs {} parts of {} bytes (limit {MAX_PARTS}); raise transfer.part_size",
                layout.count(),
                layout.part_size
            )));
        }

        let origin = task.plaintext.seek(SeekFrom::Current(0)).await?;
        let mut restarted = false;
        loop {
            let session = self.open_session(task, layout).await?;
            match self.run_session(token, task, layout, session).await? {
                Attempt::Done(asset) => return Ok(asset),
                Attempt::Stale(upload) if !restarted => {
                    warn!(
                        dest = %task.destination,
                        upload_id = %upload,
                        "stored parts do not match re-sealed output; starting a new upload"
                    );
                    self.discard_session(&task.destination, &upload, &*task.signer)
                        .await?;
                    task.plaintext.seek(SeekFrom::Start(origin)).await?;
                    restarted = true;
                }
                Attempt::Stale(upload) => {
                    return Err(StowError::transfer(anyhow::anyhow!(
                        "upload {upload} to {} diverged twice",
                        task.destination
                    )));
                }
            }
        }
    }

    /// Resume the incomplete session registered for the destination when its
    /// key material is still stashed; otherwise discard it and start anew.
    async fn open_session(&self, task: &UploadTask, layout: PartLayout) -> StowResult<Session> {
        let dest = &task.destination;
        let signer = &*task.signer;

        let existing = self
            .store
            .find_multipart(dest, signer)
            .await
            .map_err(StowError::transfer)?;

        if let Some(upload) = existing {
            match self.stashed_keys(dest, &upload) {
                Some(keys) => {
                    let parts = self
                        .store
                        .list_parts(dest, &upload, signer)
                        .await
                        .map_err(StowError::transfer)?;
                    if parts.iter().all(|p| layout.size_of(p.number) == Some(p.size)) {
                        info!(
                            dest = %dest,
                            upload_id = %upload,
                            stored_parts = parts.len(),
                            "resuming incomplete upload"
                        );
                        return Ok(Session {
                            upload,
                            keys: Some(keys),
                            accepted: parts.into_iter().map(|p| (p.number, p)).collect(),
                        });
                    }
                    warn!(dest = %dest, upload_id = %upload, "stored part layout differs; discarding upload");
                }
                None => {
                    info!(dest = %dest, upload_id = %upload, "no key material for incomplete upload; discarding it");
                }
            }
            self.discard_session(dest, &upload, signer).await?;
        }

        self.forget_keys(dest);
        let upload = self
            .store
            .initiate_multipart(dest, signer)
            .await
            .map_err(StowError::transfer)?;
        debug!(dest = %dest, upload_id = %upload, parts = layout.count(), "initiated upload");
        Ok(Session {
            upload,
            keys: None,
            accepted: BTreeMap::new(),
        })
    }

    async fn discard_session(
        &self,
        dest: &Destination,
        upload: &UploadId,
        signer: &dyn RequestSigner,
    ) -> StowResult<()> {
        self.forget_keys(dest);
        self.store
            .abort_multipart(dest, upload, signer)
            .await
            .map_err(StowError::transfer)
    }

    async fn run_session(
        &self,
        token: &CancellationToken,
        task: &mut UploadTask,
        layout: PartLayout,
        session: Session,
    ) -> StowResult<Attempt> {
        let Session {
            upload,
            keys,
            accepted,
        } = session;
        let dest = task.destination.clone();
        let signer = task.signer.clone();
        let mut progress = ProgressTracker::new(layout.total, task.progress.clone(), token.clone());

        let mut encrypter = SignEncrypter::new();
        let mut stream = match keys {
            Some(keys) => encrypter.resume(&mut task.plaintext, keys),
            None => encrypter.encrypt(&mut task.plaintext),
        };
        let keys = stream.keys().clone();
        self.stash_keys(&dest, &upload, &keys);

        let part_size = layout.part_size as usize;
        let max_inflight = self.config.max_concurrent_parts.max(1);
        let mut inflight: JoinSet<StowResult<PartInfo>> = JoinSet::new();
        let mut done: Vec<PartInfo> = Vec::with_capacity(layout.count() as usize);
        let mut pending = BytesMut::with_capacity(part_size);
        let mut produced = 0u64;
        let mut number = 0u32;
        let mut skipped = 0u64;

        loop {
            progress.check_canceled()?;
            let sealed = stream.next_sealed().await?;
            let exhausted = sealed.is_none();
            if let Some(sealed) = sealed {
                produced += sealed.bytes.len() as u64;
                pending.extend_from_slice(&sealed.bytes);
            }

            while pending.len() >= part_size || (exhausted && !pending.is_empty()) {
                let take = part_size.min(pending.len());
                let data = pending.split_to(take).freeze();
                number += 1;

                if let Some(stored) = accepted.get(&number) {
                    if stored.size != data.len() as u64 || stored.checksum != part_checksum(&data) {
                        return Ok(Attempt::Stale(upload));
                    }
                    debug!(part = number, bytes = stored.size, "part already stored; skipping");
                    skipped += stored.size;
                    done.push(stored.clone());
                    progress.advance(stored.size)?;
                    continue;
                }

                while inflight.len() >= max_inflight {
                    join_part(&mut inflight, &mut done, &mut progress).await?;
                }
                inflight.spawn(transfer_part(
                    self.store.clone(),
                    signer.clone(),
                    dest.clone(),
                    upload.clone(),
                    number,
                    data,
                    token.clone(),
                ));
            }

            if exhausted {
                break;
            }
        }

        while !inflight.is_empty() {
            join_part(&mut inflight, &mut done, &mut progress).await?;
        }
        check_sealed_len(produced, layout.total)?;

        done.sort_by_key(|p| p.number);
        progress.check_canceled()?;
        self.store
            .complete_multipart(&dest, &upload, &done, &*signer)
            .await
            .map_err(StowError::transfer)?;
        self.forget_keys(&dest);

        debug!(
            dest = %dest,
            upload_id = %upload,
            parts = done.len(),
            skipped_bytes = skipped,
            "completed upload"
        );
        Ok(Attempt::Done(asset_for(&dest, layout.total, &keys)))
    }
}

async fn transfer_part(
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn RequestSigner>,
    dest: Destination,
    upload: UploadId,
    number: u32,
    data: Bytes,
    token: CancellationToken,
) -> StowResult<PartInfo> {
    let size = data.len() as u64;
    tokio::select! {
        _ = token.cancelled() => Err(StowError::Canceled),
        res = store.upload_part(&dest, &upload, number, data, &*signer) => {
            let checksum = res.map_err(|e| {
                StowError::transfer(e.context(format!("uploading part {number} of {upload}")))
            })?;
            debug!(part = number, bytes = size, "part stored");
            Ok(PartInfo { number, size, checksum })
        }
    }
}

async fn join_part(
    inflight: &mut JoinSet<StowResult<PartInfo>>,
    done: &mut Vec<PartInfo>,
    progress: &mut ProgressTracker,
) -> StowResult<()> {
    match inflight.join_next().await {
        Some(Ok(Ok(part))) => {
            let size = part.size;
            done.push(part);
            progress.advance(size)
        }
        Some(Ok(Err(e))) => Err(e),
        Some(Err(join)) => Err(StowError::transfer(anyhow::anyhow!(
            "part upload task failed: {join}"
        ))),
        None => Ok(()),
    }
}

fn check_sealed_len(produced: u64, expected: u64) -> StowResult<()> {
    if produced != expected {
        return Err(StowError::Framing(format!(
            "plaintext does not match its declared size: sealed {produced} bytes, expected {expected}"
        )));
    }
    Ok(())
}

fn asset_for(dest: &Destination, size: u64, keys: &AssetKeys) -> Asset {
    Asset {
        object_key: dest.object_key.clone(),
        size,
        encrypt_key: *keys.encrypt_key().as_bytes(),
        verify_key: keys.verify_key().to_bytes(),
    }
}
